//! Per-particle field storage for multi-device SPH.
//!
//! This crate owns the data layer shared by every compute device:
//! - [`quantity`] -- buffer keys, buffer families, and the quantity catalogue
//!   binding each key to exactly one element type.
//! - [`buffer`] -- a single typed (optionally double-buffered) field, plus the
//!   type-erased [`ErasedBuffer`] view used by transfer and reduction code.
//! - [`buffer_list`] -- the keyed collection a device worker owns.
//! - [`grid`] -- uniform-grid decomposition of the world and the cell hash.
//! - [`types`] -- plain-old-data element types.

#![warn(missing_docs)]

pub mod buffer;
pub mod buffer_list;
pub mod error;
pub mod grid;
pub mod quantity;
pub mod types;

pub use buffer::{Buffer, ErasedBuffer};
pub use buffer_list::BufferList;
pub use error::{BufferError, GridError};
pub use grid::GridDecomposition;
pub use quantity::{BufferKey, Family, FamilyKind, Quantity, QuantityInfo};
pub use types::ParticleInfo;
