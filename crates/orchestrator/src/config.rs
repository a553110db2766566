//! Configuration parsing and validation for a simulation run

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use fields::{GridDecomposition, GridError};

use crate::device::{Topology, MAX_DEVICES_PER_NODE, MAX_NODES};
use crate::error::{ConfigError, StateError};
use crate::export::ExportTarget;

/// Axis along which the initial device map splits the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SplitAxis {
    /// Slabs across x
    #[default]
    X,
    /// Slabs across y
    Y,
    /// Slabs across z
    Z,
}

impl SplitAxis {
    /// Axis index (0 = x)
    pub fn index(self) -> usize {
        match self {
            SplitAxis::X => 0,
            SplitAxis::Y => 1,
            SplitAxis::Z => 2,
        }
    }
}

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Problem name, used in output file names
    pub name: String,
    /// Directory receiving exported files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Initial inter-particle distance
    pub deltap: f32,
    /// Minimum corner of the world
    #[serde(default)]
    pub world_origin: [f32; 3],
    /// Extent of the world
    pub world_size: [f32; 3],
    /// Minimum cell extent; defaults to twice `deltap` on every axis
    #[serde(default)]
    pub cell_size: Option<[f32; 3]>,
    /// Devices per node
    #[serde(default = "default_one")]
    pub devices: usize,
    /// Number of nodes
    #[serde(default = "default_one")]
    pub nodes: usize,
    /// Rank of this process
    #[serde(default)]
    pub rank: usize,
    /// Host name of this process
    #[serde(default = "default_processor_name")]
    pub processor_name: String,
    /// Number of particles to seed
    pub particle_count: usize,
    /// Initial timestep, also the largest timestep allowed
    #[serde(default = "default_dt")]
    pub dt: f32,
    /// Gravity vector (m/s^2)
    #[serde(default = "default_gravity")]
    pub gravity: [f32; 3],
    /// Stop after this many iterations
    pub max_iterations: Option<u64>,
    /// Stop after this much simulated time (seconds)
    pub max_time: Option<f64>,
    /// Dump particle state to the host every N iterations (0 disables)
    #[serde(default = "default_dump_every")]
    pub dump_every: u64,
    /// Axis of the initial device split
    #[serde(default)]
    pub split_axis: SplitAxis,
    /// Export the device map after it is recorded
    #[serde(default)]
    pub save_device_map: bool,
}

// Default values
fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_one() -> usize {
    1
}

fn default_processor_name() -> String {
    "localhost".to_string()
}

fn default_dt() -> f32 {
    1e-4
}

fn default_gravity() -> [f32; 3] {
    [0.0, 0.0, -9.81]
}

fn default_dump_every() -> u64 {
    100
}

impl RunConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&contents)?;
        tracing::info!("Loaded configuration '{}' from {}", config.name, path.display());
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.name.is_empty() {
            return invalid("name must not be empty");
        }
        if !(self.deltap.is_finite() && self.deltap > 0.0) {
            return invalid("deltap must be positive");
        }
        if self.world_size.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return invalid("world_size must be positive on every axis");
        }
        if let Some(cell) = self.cell_size {
            if cell.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                return invalid("cell_size must be positive on every axis");
            }
        }
        if self.devices == 0 || self.devices > MAX_DEVICES_PER_NODE {
            return Err(ConfigError::Invalid(format!(
                "devices must be in 1..={}",
                MAX_DEVICES_PER_NODE
            )));
        }
        if self.nodes == 0 || self.nodes > MAX_NODES {
            return Err(ConfigError::Invalid(format!("nodes must be in 1..={}", MAX_NODES)));
        }
        if self.rank >= self.nodes {
            return invalid("rank must be less than nodes");
        }
        if self.particle_count == 0 {
            return invalid("particle_count must be at least 1");
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return invalid("dt must be positive");
        }
        if self.max_iterations == Some(0) {
            return invalid("max_iterations must be at least 1");
        }
        if let Some(max_time) = self.max_time {
            if max_time <= 0.0 {
                return invalid("max_time must be positive");
            }
        }
        Ok(())
    }

    /// Requested cell extent
    pub fn cell_size(&self) -> [f32; 3] {
        self.cell_size.unwrap_or([2.0 * self.deltap; 3])
    }

    /// Grid covering the world with cells of at least [`cell_size`](Self::cell_size)
    pub fn grid(&self) -> Result<GridDecomposition, GridError> {
        GridDecomposition::new(self.world_origin, self.world_size, self.cell_size())
    }

    /// Devices and nodes of the run
    pub fn topology(&self) -> Result<Topology, StateError> {
        Topology::new(self.devices, self.nodes, self.rank)
    }

    /// Device-map export destination
    pub fn export_target(&self) -> ExportTarget {
        ExportTarget {
            dir: self.output_dir.clone(),
            name: self.name.clone(),
            deltap: self.deltap,
            processor_name: self.processor_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> &'static str {
        r#"{
            "name": "box",
            "deltap": 0.05,
            "world_size": [1.0, 1.0, 0.5],
            "particle_count": 100
        }"#
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::from_json(minimal()).unwrap();
        assert_eq!(config.devices, 1);
        assert_eq!(config.nodes, 1);
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.world_origin, [0.0; 3]);
        assert_eq!(config.gravity, default_gravity());
        assert_eq!(config.split_axis, SplitAxis::X);
        assert_eq!(config.cell_size(), [0.1; 3]);
        assert!(!config.save_device_map);
    }

    #[test]
    fn test_grid_covers_world() {
        let config = RunConfig::from_json(minimal()).unwrap();
        let grid = config.grid().unwrap();
        assert_eq!(grid.grid_size(), [10, 10, 5]);
        assert!(grid.covers_world());
    }

    #[test]
    fn test_validation_deltap() {
        let mut config = RunConfig::from_json(minimal()).unwrap();
        config.deltap = -0.01;
        assert!(config.validate().is_err());
        config.deltap = 0.01;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_topology() {
        let mut config = RunConfig::from_json(minimal()).unwrap();
        config.devices = MAX_DEVICES_PER_NODE + 1;
        assert!(config.validate().is_err());
        config.devices = 2;
        config.nodes = 2;
        config.rank = 2;
        assert!(config.validate().is_err());
        config.rank = 1;
        assert!(config.validate().is_ok());
        assert!(config.topology().unwrap().is_multi_node());
    }

    #[test]
    fn test_validation_stopping() {
        let mut config = RunConfig::from_json(minimal()).unwrap();
        config.max_iterations = Some(0);
        assert!(config.validate().is_err());
        config.max_iterations = Some(10);
        config.max_time = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        let err = RunConfig::from_json("{ \"name\": 3 }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunConfig::load("/nonexistent/run.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/run.json"));
    }
}
