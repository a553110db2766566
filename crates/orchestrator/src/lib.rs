//! Orchestration Layer
//!
//! This crate coordinates a multi-device SPH run on top of the `fields` data
//! layer:
//! - Command token and flags published to every device
//! - Read/write generation bookkeeping for double-buffered quantities
//! - Global device ids, node topology and the cell-to-device map
//! - The `GlobalData` coordinator (step protocol, counts, clock, stop)
//! - Device workers, the thread pool driving them and the step driver
//! - Run configuration and device-map export

#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod export;
pub mod format;
pub mod generation;
pub mod global;
pub mod host_worker;
pub mod simulation;
pub mod stop;
pub mod worker;

pub use command::{Command, CommandFlags, CommandType};
pub use config::RunConfig;
pub use device::{DeviceMap, GlobalDeviceId, Topology, DEVICE_BITS};
pub use error::{ConfigError, SimError, StateError, WorkerError};
pub use generation::{Generation, GenerationTable};
pub use global::{GlobalData, Phase};
pub use simulation::{RunSummary, Simulation, StopReason};
pub use stop::StopFlag;
pub use worker::{DeviceWorker, StepContext, WorkerPool, WorkerReport};

use std::path::Path;

/// Create a complete simulation from a configuration file
///
/// Loads and validates the configuration, builds the grid and the device
/// map, seeds one host worker per local device and starts the worker pool.
/// The returned simulation polls `stop` after every command.
///
/// # Example
/// ```no_run
/// use orchestrator::{create_simulation, StopFlag};
///
/// let mut sim = create_simulation("config/box.json", StopFlag::new())?;
/// let summary = sim.run()?;
/// println!("{} iterations", summary.iterations);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_simulation(
    config_path: impl AsRef<Path>,
    stop: StopFlag,
) -> Result<Simulation, SimError> {
    let config = RunConfig::load(config_path)?;
    Simulation::from_config(&config, stop)
}
