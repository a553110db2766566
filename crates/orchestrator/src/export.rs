//! Device-map export as CSV, one line per grid cell.
//!
//! Files are meant for external visualization tools. The header is
//! `X,Y,Z,LINEARIZED,VALUE` and cells are listed with X outermost and Z
//! innermost.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use fields::GridDecomposition;

use crate::device::{DeviceMap, Topology};
use crate::format::general_float;

/// Header line of every exported map.
pub const CSV_HEADER: &str = "X,Y,Z,LINEARIZED,VALUE";

/// Where and under which name maps of a run are written.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTarget {
    /// Output directory.
    pub dir: PathBuf,
    /// Problem name.
    pub name: String,
    /// Particle spacing, part of every file name.
    pub deltap: f32,
    /// Host name of this process, used in multi-node file names.
    pub processor_name: String,
}

impl ExportTarget {
    /// `<dir>/[<prefix>_]<name>_dp<deltap>`, without extension.
    fn stem(&self, prefix: &str) -> String {
        let mut stem = String::new();
        if !prefix.is_empty() {
            stem.push_str(prefix);
            stem.push('_');
        }
        stem.push_str(&self.name);
        stem.push_str("_dp");
        stem.push_str(&general_float(self.deltap as f64));
        stem
    }

    /// Path of the device map of this process.
    ///
    /// Multi-node runs append `_rank<rank>.<nodes>.<processor>` so every
    /// process writes its own file.
    pub fn device_map_path(&self, prefix: &str, topology: &Topology) -> PathBuf {
        let mut file = self.stem(prefix);
        if topology.is_multi_node() {
            file.push_str(&format!(
                "_rank{}.{}.{}",
                topology.rank(),
                topology.nodes(),
                self.processor_name
            ));
        }
        file.push_str(".csv");
        self.dir.join(file)
    }

    /// Path of the compact map of local device `device`.
    ///
    /// Nodes with several devices append `_dev<device>.<devices>`.
    pub fn compact_map_path(&self, prefix: &str, device: usize, devices: usize) -> PathBuf {
        let mut file = self.stem(prefix);
        if devices > 1 {
            file.push_str(&format!("_dev{}.{}", device, devices));
        }
        file.push_str(".csv");
        self.dir.join(file)
    }
}

/// Write one line per cell of `grid` with the value `value(hash)`.
fn write_cells<W, F>(out: &mut W, grid: &GridDecomposition, value: F) -> io::Result<()>
where
    W: Write,
    F: Fn(u32) -> u32,
{
    writeln!(out, "{}", CSV_HEADER)?;
    let [gx, gy, gz] = grid.grid_size();
    for ix in 0..gx {
        for iy in 0..gy {
            for iz in 0..gz {
                let hash = grid.linearize([ix, iy, iz]);
                writeln!(out, "{},{},{},{},{}", ix, iy, iz, hash, value(hash))?;
            }
        }
    }
    Ok(())
}

fn write_file<F>(path: &Path, grid: &GridDecomposition, value: F) -> io::Result<()>
where
    F: Fn(u32) -> u32,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    write_cells(&mut out, grid, value)?;
    out.flush()
}

/// Write the device map of this process and return the file path.
pub fn save_device_map(
    target: &ExportTarget,
    prefix: &str,
    grid: &GridDecomposition,
    map: &DeviceMap,
    topology: &Topology,
) -> io::Result<PathBuf> {
    if map.len() != grid.n_grid_cells() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "device map has {} cells, grid has {}",
                map.len(),
                grid.n_grid_cells()
            ),
        ));
    }
    let path = target.device_map_path(prefix, topology);
    write_file(&path, grid, |hash| map.get(hash).unwrap_or_default() as u32)?;
    tracing::info!("Device map dumped to file {}", path.display());
    Ok(path)
}

/// Write the compact map of one device, showing the cell type held in the
/// two top bits of every entry, and return the file path.
pub fn save_compact_device_map(
    target: &ExportTarget,
    prefix: &str,
    grid: &GridDecomposition,
    compact: &[u32],
    device: usize,
    devices: usize,
) -> io::Result<PathBuf> {
    if compact.len() != grid.n_grid_cells() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "compact map has {} cells, grid has {}",
                compact.len(),
                grid.n_grid_cells()
            ),
        ));
    }
    let path = target.compact_map_path(prefix, device, devices);
    write_file(&path, grid, |hash| compact[hash as usize] >> 30)?;
    tracing::info!("Compact device map dumped to file {}", path.display());
    Ok(path)
}
