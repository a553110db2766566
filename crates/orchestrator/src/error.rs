//! Error types of the coordination layer.

use std::path::PathBuf;

use fields::{BufferError, BufferKey, GridError};
use thiserror::Error;

use crate::command::CommandType;

/// Violations of the coordinator's step protocol.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// A command was issued while the previous one had not completed.
    #[error("cannot issue {requested}: {pending} is still in flight")]
    CommandInFlight {
        /// Command being issued.
        requested: CommandType,
        /// Command still executing.
        pending: CommandType,
    },

    /// Completion was reported with no command dispatched.
    #[error("no command is in flight")]
    NoCommandInFlight,

    /// The coordinator already reached its terminal state.
    #[error("simulation has quit, no further commands accepted")]
    Terminated,

    /// Generations can only be swapped between steps.
    #[error("cannot swap generations while {0} is executing")]
    StepInProgress(CommandType),

    /// The device map is installed once.
    #[error("device map already recorded")]
    DeviceMapAlreadyRecorded,

    /// The device map does not have one entry per grid cell.
    #[error("device map has {got} entries, grid has {expected} cells")]
    DeviceMapSize {
        /// Number of grid cells.
        expected: usize,
        /// Number of map entries.
        got: usize,
    },

    /// A per-device array does not have one entry per local device.
    #[error("expected {expected} per-device entries, got {got}")]
    DeviceCount {
        /// Number of local devices.
        expected: usize,
        /// Number of entries supplied.
        got: usize,
    },

    /// A device index outside the local device range.
    #[error("device {device} out of range (node has {devices} devices)")]
    UnknownDevice {
        /// Offending index.
        device: usize,
        /// Number of local devices.
        devices: usize,
    },

    /// A local device did not report on the completed command.
    #[error("device {0} did not report")]
    MissingReport(usize),

    /// A local device reported more than once on the same command.
    #[error("device {0} reported more than once")]
    DuplicateReport(usize),

    /// Per-device counts add up past what the particle index can hold.
    #[error("particle counts {0:?} overflow the particle index")]
    ParticleCountOverflow(Vec<u32>),

    /// Dumped data does not fit the host buffer at the device's offset.
    #[error("device {device}: dump of {key:?} does not fit the host buffer")]
    HostSnapshot {
        /// Local device index.
        device: usize,
        /// Dumped key.
        key: BufferKey,
    },

    /// Device or node counts outside what a global device id can encode.
    #[error("invalid topology: {devices} devices per node, {nodes} nodes, rank {rank}")]
    InvalidTopology {
        /// Devices per node.
        devices: usize,
        /// Number of nodes.
        nodes: usize,
        /// Rank of this process.
        rank: usize,
    },

    /// The grid could not be built.
    #[error("invalid grid: {0}")]
    InvalidGrid(#[from] GridError),
}

/// Errors reported by a device worker or the pool driving it.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A buffer operation failed.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// The command needs a buffer the worker does not own.
    #[error("device {device}: missing buffer {key:?}")]
    MissingBuffer {
        /// Local device index.
        device: usize,
        /// Required key.
        key: BufferKey,
    },

    /// The worker thread could not be started.
    #[error("device {device}: failed to spawn worker thread: {source}")]
    Spawn {
        /// Local device index.
        device: usize,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The worker thread is gone.
    #[error("device {0}: worker disconnected")]
    Disconnected(usize),

    /// Any other failure while executing a command.
    #[error("device {device}: {command} failed: {reason}")]
    Failed {
        /// Local device index.
        device: usize,
        /// Command being executed.
        command: CommandType,
        /// Human-readable cause.
        reason: String,
    },
}

/// Errors loading or validating a run configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid JSON for a run configuration.
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of its valid range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error of a simulation run.
#[derive(Error, Debug)]
pub enum SimError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Coordinator protocol error.
    #[error(transparent)]
    State(#[from] StateError),

    /// Worker error.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Buffer error on the coordinator side.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Grid error.
    #[error(transparent)]
    Grid(#[from] GridError),
}
