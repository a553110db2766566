//! CPU device worker.
//!
//! Executes the coordinator protocol on host memory: hashing, sorting,
//! reordering into the write generation, a constant-gravity force pass with a
//! timestep estimate, explicit Euler integration and dumps. It exercises the
//! data contracts of the coordinator; it does not model fluid physics.
//! Commands it has nothing to do for complete with an empty report.

use fields::quantity::{CellEnd, CellStart, Forces, Hash, Info, PartIndex, Pos, Vel};
use fields::types::Float4;
use fields::{BufferError, BufferKey, BufferList, GridDecomposition, ParticleInfo, Quantity};

use crate::command::CommandType;
use crate::error::WorkerError;
use crate::generation::GenerationTable;
use crate::worker::{DeviceWorker, StepContext, WorkerReport};

/// Fraction of a cell a particle may travel in one step.
const CFL_FACTOR: f32 = 0.3;
/// Safety factor of the free-fall timestep bound.
const FORCE_FACTOR: f32 = 0.25;
/// Cell start value marking an empty cell.
pub const EMPTY_CELL: u32 = u32::MAX;

/// One particle to load into a worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleSeed {
    /// Position (xyz) and mass (w).
    pub pos: Float4,
    /// Velocity (xyz) and density (w).
    pub vel: Float4,
    /// Type tag.
    pub info: ParticleInfo,
}

/// Fluid particles on a cubic lattice of spacing `deltap`, filling the grid
/// from its origin, at most `count` of them.
pub fn lattice(grid: &GridDecomposition, deltap: f32, count: usize) -> Vec<ParticleSeed> {
    let origin = grid.world_origin();
    let size = grid.world_size();
    let per_axis = |axis: usize| ((size[axis] / deltap).floor() as usize).max(1);
    let (nx, ny, nz) = (per_axis(0), per_axis(1), per_axis(2));
    let mass = deltap * deltap * deltap * 1000.0;

    let mut seeds = Vec::with_capacity(count.min(nx * ny * nz));
    'fill: for iz in 0..nz {
        for iy in 0..ny {
            for ix in 0..nx {
                if seeds.len() == count {
                    break 'fill;
                }
                let at = |i: usize, axis: usize| origin[axis] + (i as f32 + 0.5) * deltap;
                seeds.push(ParticleSeed {
                    pos: [at(ix, 0), at(iy, 1), at(iz, 2), mass],
                    vel: [0.0, 0.0, 0.0, 1000.0],
                    info: ParticleInfo::fluid(seeds.len() as u32),
                });
            }
        }
    }
    seeds
}

/// Device worker running on the host.
#[derive(Debug)]
pub struct HostWorker {
    device: usize,
    capacity: usize,
    particles: usize,
    gravity: [f32; 3],
    buffers: BufferList,
}

impl HostWorker {
    /// Worker for local device `device` able to hold `capacity` particles
    /// on `grid`.
    pub fn new(
        device: usize,
        capacity: usize,
        grid: &GridDecomposition,
        gravity: [f32; 3],
    ) -> Result<Self, BufferError> {
        let mut buffers = BufferList::new();
        buffers
            .add::<Pos>()?
            .add::<Vel>()?
            .add::<Info>()?
            .add::<Hash>()?
            .add::<PartIndex>()?
            .add::<Forces>()?
            .add_with_fill::<CellStart>(0xFF)?
            .add_with_fill::<CellEnd>(0xFF)?;
        let cells = grid.n_grid_cells();
        let mut bytes = buffers.allocate(BufferKey::CELL_START, cells)?;
        bytes += buffers.allocate(BufferKey::CELL_END, cells)?;
        bytes += buffers.allocate_all(capacity)?;
        tracing::info!(
            "Device {}: {} allocated for {} particles",
            device,
            crate::format::mem_string(bytes),
            crate::format::add_separators(capacity as i64)
        );
        Ok(Self {
            device,
            capacity,
            particles: 0,
            gravity,
            buffers,
        })
    }

    /// Buffers owned by this worker.
    pub fn buffers(&self) -> &BufferList {
        &self.buffers
    }

    /// Load `seeds` into generation 0, replacing the current particles.
    pub fn load(&mut self, seeds: &[ParticleSeed]) -> Result<(), WorkerError> {
        if seeds.len() > self.capacity {
            return Err(WorkerError::Failed {
                device: self.device,
                command: CommandType::Idle,
                reason: format!(
                    "{} particles exceed capacity {}",
                    seeds.len(),
                    self.capacity
                ),
            });
        }
        let n = seeds.len();
        let pos = self.data_mut::<Pos>(0, n)?;
        for (slot, seed) in pos.iter_mut().zip(seeds) {
            *slot = seed.pos;
        }
        let vel = self.data_mut::<Vel>(0, n)?;
        for (slot, seed) in vel.iter_mut().zip(seeds) {
            *slot = seed.vel;
        }
        let info = self.data_mut::<Info>(0, n)?;
        for (slot, seed) in info.iter_mut().zip(seeds) {
            *slot = seed.info;
        }
        self.particles = n;
        Ok(())
    }

    fn missing(&self, key: BufferKey) -> WorkerError {
        WorkerError::MissingBuffer {
            device: self.device,
            key,
        }
    }

    fn data<Q: Quantity>(&self, index: usize, n: usize) -> Result<&[Q::Element], WorkerError> {
        self.buffers
            .data::<Q>(index)
            .and_then(|d| d.get(..n))
            .ok_or_else(|| self.missing(Q::KEY))
    }

    fn data_mut<Q: Quantity>(
        &mut self,
        index: usize,
        n: usize,
    ) -> Result<&mut [Q::Element], WorkerError> {
        let missing = self.missing(Q::KEY);
        self.buffers
            .data_mut::<Q>(index)
            .and_then(|d| d.get_mut(..n))
            .ok_or(missing)
    }

    fn calc_hash(&mut self, ctx: &StepContext) -> Result<(), WorkerError> {
        let n = self.particles;
        let read = ctx.generations.read_index(BufferKey::POS);
        let hashes: Vec<u32> = self
            .data::<Pos>(read, n)?
            .iter()
            .map(|p| ctx.grid.hash_of([p[0], p[1], p[2]]))
            .collect();
        self.data_mut::<Hash>(0, n)?.copy_from_slice(&hashes);
        for (i, slot) in self.data_mut::<PartIndex>(0, n)?.iter_mut().enumerate() {
            *slot = i as u32;
        }
        Ok(())
    }

    fn sort(&mut self) -> Result<(), WorkerError> {
        let n = self.particles;
        let mut pairs: Vec<(u32, u32)> = self
            .data::<Hash>(0, n)?
            .iter()
            .copied()
            .zip(self.data::<PartIndex>(0, n)?.iter().copied())
            .collect();
        pairs.sort_by_key(|&(hash, _)| hash);
        for (slot, (hash, _)) in self.data_mut::<Hash>(0, n)?.iter_mut().zip(&pairs) {
            *slot = *hash;
        }
        for (slot, (_, index)) in self.data_mut::<PartIndex>(0, n)?.iter_mut().zip(&pairs) {
            *slot = *index;
        }
        Ok(())
    }

    fn reorder(&mut self, ctx: &StepContext) -> Result<(), WorkerError> {
        let n = self.particles;
        let order = self.data::<PartIndex>(0, n)?.to_vec();
        permute::<Pos>(&mut self.buffers, &order, &ctx.generations, self.device)?;
        permute::<Vel>(&mut self.buffers, &order, &ctx.generations, self.device)?;
        permute::<Info>(&mut self.buffers, &order, &ctx.generations, self.device)?;

        let hashes = self.data::<Hash>(0, n)?.to_vec();
        let cells = ctx.grid.n_grid_cells();
        let start = self.data_mut::<CellStart>(0, cells)?;
        start.fill(EMPTY_CELL);
        for (i, &h) in hashes.iter().enumerate() {
            if i == 0 || hashes[i - 1] != h {
                start[h as usize] = i as u32;
            }
        }
        let end = self.data_mut::<CellEnd>(0, cells)?;
        end.fill(EMPTY_CELL);
        for (i, &h) in hashes.iter().enumerate() {
            if i + 1 == hashes.len() || hashes[i + 1] != h {
                end[h as usize] = i as u32 + 1;
            }
        }
        Ok(())
    }

    /// Gravity on fluid particles. Returns the timestep bound of this
    /// device, `None` when nothing limits it.
    fn forces(&mut self, ctx: &StepContext) -> Result<Option<f32>, WorkerError> {
        let n = self.particles;
        let info_read = ctx.generations.read_index(BufferKey::INFO);
        let fluid: Vec<bool> = self
            .data::<Info>(info_read, n)?
            .iter()
            .map(ParticleInfo::is_fluid)
            .collect();
        let g = self.gravity;
        for (force, &is_fluid) in self.data_mut::<Forces>(0, n)?.iter_mut().zip(&fluid) {
            *force = if is_fluid {
                [g[0], g[1], g[2], 0.0]
            } else {
                [0.0; 4]
            };
        }

        let h = ctx
            .grid
            .cell_size()
            .into_iter()
            .fold(f32::INFINITY, f32::min);
        let vel_read = ctx.generations.read_index(BufferKey::VEL);
        let vmax = self
            .data::<Vel>(vel_read, n)?
            .iter()
            .map(|v| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt())
            .fold(0.0, f32::max);
        let gmag = (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt();

        let cfl = (vmax > 0.0).then(|| CFL_FACTOR * h / vmax);
        let free_fall = (gmag > 0.0).then(|| FORCE_FACTOR * (h / gmag).sqrt());
        Ok(match (cfl, free_fall) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    fn euler(&mut self, ctx: &StepContext) -> Result<(), WorkerError> {
        let n = self.particles;
        let dt = ctx.command.extra_arg.unwrap_or(ctx.dt);
        let gens = &ctx.generations;
        let forces = self.data::<Forces>(0, n)?.to_vec();

        let device = self.device;
        let split_error = |key| WorkerError::MissingBuffer { device, key };
        let vel = self
            .buffers
            .get_mut::<Vel>()
            .ok_or(split_error(BufferKey::VEL))?;
        let (vel_r, vel_w) = vel
            .split_generations(gens.read_index(BufferKey::VEL), gens.write_index(BufferKey::VEL))
            .ok_or(split_error(BufferKey::VEL))?;
        for i in 0..n {
            let (v, f) = (vel_r[i], forces[i]);
            vel_w[i] = [v[0] + f[0] * dt, v[1] + f[1] * dt, v[2] + f[2] * dt, v[3]];
        }
        let new_vel = vel_w[..n].to_vec();

        let pos = self
            .buffers
            .get_mut::<Pos>()
            .ok_or(split_error(BufferKey::POS))?;
        let (pos_r, pos_w) = pos
            .split_generations(gens.read_index(BufferKey::POS), gens.write_index(BufferKey::POS))
            .ok_or(split_error(BufferKey::POS))?;
        for i in 0..n {
            let (p, v) = (pos_r[i], new_vel[i]);
            pos_w[i] = [p[0] + v[0] * dt, p[1] + v[1] * dt, p[2] + v[2] * dt, p[3]];
        }

        permute_identity::<Info>(&mut self.buffers, n, gens, device)
    }

    fn dump(&self, ctx: &StepContext) -> Result<Vec<(BufferKey, Vec<u8>)>, WorkerError> {
        let flags = ctx.command.flags;
        ctx.command
            .buffers
            .single_keys()
            .map(|key| {
                let index = ctx.generations.select(key, flags);
                self.buffers
                    .byte_range(key, index, 0, self.particles)
                    .map(|bytes| (key, bytes.to_vec()))
                    .ok_or_else(|| self.missing(key))
            })
            .collect()
    }
}

/// Write the read generation of `Q`, permuted by `order`, into its write
/// generation.
fn permute<Q: Quantity>(
    buffers: &mut BufferList,
    order: &[u32],
    gens: &GenerationTable,
    device: usize,
) -> Result<(), WorkerError> {
    let missing = || WorkerError::MissingBuffer { device, key: Q::KEY };
    let (src, dst) = buffers
        .get_mut::<Q>()
        .ok_or_else(missing)?
        .split_generations(gens.read_index(Q::KEY), gens.write_index(Q::KEY))
        .ok_or_else(missing)?;
    for (slot, &from) in dst.iter_mut().zip(order) {
        *slot = *src.get(from as usize).ok_or_else(missing)?;
    }
    Ok(())
}

/// Copy the first `n` elements of the read generation of `Q` into its write
/// generation.
fn permute_identity<Q: Quantity>(
    buffers: &mut BufferList,
    n: usize,
    gens: &GenerationTable,
    device: usize,
) -> Result<(), WorkerError> {
    let order: Vec<u32> = (0..n as u32).collect();
    permute::<Q>(buffers, &order, gens, device)
}

impl DeviceWorker for HostWorker {
    fn device(&self) -> usize {
        self.device
    }

    fn particles(&self) -> u32 {
        self.particles as u32
    }

    fn execute(&mut self, ctx: &StepContext) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport::new(self.device);
        match ctx.command.kind {
            CommandType::CalcHash => self.calc_hash(ctx)?,
            CommandType::Sort => self.sort()?,
            CommandType::Reorder => {
                self.reorder(ctx)?;
                report.particles = Some(self.particles as u32);
            }
            CommandType::Forces => report.dt = self.forces(ctx)?,
            CommandType::Euler => self.euler(ctx)?,
            CommandType::Dump => report.dumped = self.dump(ctx)?,
            _ => {}
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandFlags};
    use crate::device::Topology;

    fn grid() -> GridDecomposition {
        GridDecomposition::from_cells([0.0; 3], [1.0; 3], [4, 4, 4]).unwrap()
    }

    fn ctx(kind: CommandType, generations: &GenerationTable) -> StepContext {
        StepContext {
            command: Command::new(kind),
            generations: generations.clone(),
            grid: grid(),
            device_map: None,
            topology: Topology::single(),
            iteration: 0,
            time: 0.0,
            dt: 0.01,
        }
    }

    fn seed(x: f32, y: f32, z: f32, id: u32) -> ParticleSeed {
        ParticleSeed {
            pos: [x, y, z, 1.0],
            vel: [0.0, 0.0, 0.0, 1000.0],
            info: ParticleInfo::fluid(id),
        }
    }

    fn worker() -> HostWorker {
        let mut w = HostWorker::new(0, 8, &grid(), [0.0, 0.0, -10.0]).unwrap();
        w.load(&[
            seed(3.5, 3.5, 3.5, 0),
            seed(0.5, 0.5, 0.5, 1),
            seed(1.5, 0.5, 0.5, 2),
        ])
        .unwrap();
        w
    }

    #[test]
    fn lattice_fills_from_origin() {
        let seeds = lattice(&grid(), 0.5, 10);
        assert_eq!(seeds.len(), 10);
        assert_eq!(seeds[0].pos[..3], [0.25, 0.25, 0.25]);
        assert_eq!(seeds[1].pos[..3], [0.75, 0.25, 0.25]);
        assert_eq!(seeds[9].info.id, 9);
        assert_eq!(lattice(&grid(), 1.0, 1000).len(), 64);
    }

    #[test]
    fn load_rejects_overflow() {
        let mut w = HostWorker::new(0, 1, &grid(), [0.0; 3]).unwrap();
        let seeds = [seed(0.5, 0.5, 0.5, 0), seed(0.5, 0.5, 0.5, 1)];
        assert!(w.load(&seeds).is_err());
    }

    #[test]
    fn hash_sort_reorder() {
        let mut w = worker();
        let gens = GenerationTable::new();
        w.execute(&ctx(CommandType::CalcHash, &gens)).unwrap();
        assert_eq!(w.buffers().data::<Hash>(0).unwrap()[..3], [63, 0, 1]);
        w.execute(&ctx(CommandType::Sort, &gens)).unwrap();
        assert_eq!(w.buffers().data::<PartIndex>(0).unwrap()[..3], [1, 2, 0]);
        let report = w.execute(&ctx(CommandType::Reorder, &gens)).unwrap();
        assert_eq!(report.particles, Some(3));

        let ids: Vec<u32> = w.buffers().data::<Info>(1).unwrap()[..3]
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 0]);
        let start = w.buffers().data::<CellStart>(0).unwrap();
        let end = w.buffers().data::<CellEnd>(0).unwrap();
        assert_eq!((start[0], end[0]), (0, 1));
        assert_eq!((start[63], end[63]), (2, 3));
        assert_eq!(start[5], EMPTY_CELL);
    }

    #[test]
    fn forces_then_euler_writes_write_generation() {
        let mut w = worker();
        let gens = GenerationTable::new();
        let report = w.execute(&ctx(CommandType::Forces, &gens)).unwrap();
        // at rest only the free-fall bound applies: 0.25 * sqrt(1 / 10)
        let dt = report.dt.unwrap();
        assert!((dt - 0.25 * 0.1f32.sqrt()).abs() < 1e-6);
        assert!(dt > ctx(CommandType::Forces, &gens).dt);

        let euler = StepContext {
            command: Command::new(CommandType::Euler).with_arg(0.1),
            ..ctx(CommandType::Euler, &gens)
        };
        w.execute(&euler).unwrap();
        let vel = w.buffers().data::<Vel>(1).unwrap();
        assert!((vel[0][2] + 1.0).abs() < 1e-6);
        let pos = w.buffers().data::<Pos>(1).unwrap();
        assert!((pos[0][2] - 3.4).abs() < 1e-5);
        assert_eq!(w.buffers().data::<Pos>(0).unwrap()[0][2], 3.5);
        assert_eq!(w.buffers().data::<Info>(1).unwrap()[2].id, 2);
    }

    #[test]
    fn unconstrained_worker_reports_no_timestep() {
        let mut w = HostWorker::new(0, 2, &grid(), [0.0; 3]).unwrap();
        w.load(&[seed(0.5, 0.5, 0.5, 0)]).unwrap();
        let gens = GenerationTable::new();
        let report = w.execute(&ctx(CommandType::Forces, &gens)).unwrap();
        assert_eq!(report.dt, None);
    }

    #[test]
    fn dump_selects_generation() {
        let mut w = worker();
        let mut gens = GenerationTable::new();
        gens.swap(BufferKey::POS);
        let dump = StepContext {
            command: Command::new(CommandType::Dump)
                .with_buffers(BufferKey::POS | BufferKey::INFO)
                .with_flags(CommandFlags::DBLBUFFER_WRITE),
            ..ctx(CommandType::Dump, &gens)
        };
        let report = w.execute(&dump).unwrap();
        assert_eq!(report.dumped.len(), 2);
        let (key, bytes) = &report.dumped[0];
        assert_eq!(*key, BufferKey::POS);
        let pos: &[Float4] = bytemuck::cast_slice(bytes);
        assert_eq!(pos[0], [3.5, 3.5, 3.5, 1.0]);
        assert_eq!(report.dumped[1].1.len(), 3 * 8);
    }

    #[test]
    fn dump_of_missing_buffer_fails() {
        let mut w = worker();
        let gens = GenerationTable::new();
        let dump = StepContext {
            command: Command::new(CommandType::Dump).with_buffers(BufferKey::PRESSURE),
            ..ctx(CommandType::Dump, &gens)
        };
        assert!(matches!(
            w.execute(&dump),
            Err(WorkerError::MissingBuffer { key: BufferKey::PRESSURE, .. })
        ));
    }

    #[test]
    fn other_commands_are_no_ops() {
        let mut w = worker();
        let gens = GenerationTable::new();
        let report = w.execute(&ctx(CommandType::Vorticity, &gens)).unwrap();
        assert_eq!(report, WorkerReport::new(0));
    }
}
