//! Error types for buffer management and grid construction.

use thiserror::Error;

use crate::quantity::BufferKey;

/// Errors raised by [`Buffer`](crate::Buffer) and [`BufferList`](crate::BufferList).
///
/// Apart from [`BufferError::Allocation`], every variant signals a broken
/// caller contract and is not meant to be recovered from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// A buffer for this key is already owned by the list.
    #[error("trying to add a buffer for an already-available key: {name}")]
    DuplicateKey {
        /// Name of the quantity.
        name: &'static str,
    },

    /// The buffer was already allocated; a fresh instance is required.
    #[error("buffer {name} is already allocated")]
    AlreadyAllocated {
        /// Name of the quantity.
        name: &'static str,
    },

    /// Memory for the buffer could not be obtained.
    #[error("failed to allocate {bytes} bytes for buffer {name}")]
    Allocation {
        /// Name of the quantity.
        name: &'static str,
        /// Total bytes requested across all arrays.
        bytes: usize,
    },

    /// The requested size does not fit in `usize`.
    #[error("buffer {name}: {elements} elements overflow the addressable size")]
    SizeOverflow {
        /// Name of the quantity.
        name: &'static str,
        /// Requested element count.
        elements: usize,
    },

    /// The operation is not meaningful for this buffer family.
    #[error("can't {op} in buffer {name}")]
    Unsupported {
        /// Operation that was attempted.
        op: &'static str,
        /// Name of the quantity.
        name: &'static str,
    },

    /// No buffer with this key is present in the list.
    #[error("no buffer present for key {key:?}")]
    NotPresent {
        /// The missing key.
        key: BufferKey,
    },
}

/// Errors raised when building a [`GridDecomposition`](crate::GridDecomposition).
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum GridError {
    /// A cell extent is zero, negative or not finite.
    #[error("cell size must be positive on every axis, got {0:?}")]
    InvalidCellSize([f32; 3]),

    /// A world extent is zero, negative or not finite.
    #[error("world size must be positive on every axis, got {0:?}")]
    InvalidWorldSize([f32; 3]),

    /// A grid dimension is zero.
    #[error("grid size must be at least 1 on every axis, got {0:?}")]
    EmptyGrid([u32; 3]),

    /// The number of cells does not fit the 32-bit cell hash.
    #[error("grid of {0:?} cells exceeds the 32-bit cell hash range")]
    TooManyCells([u32; 3]),
}
