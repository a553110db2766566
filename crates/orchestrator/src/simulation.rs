//! Step driver.
//!
//! [`Simulation`] owns the coordinator and the worker pool and runs the
//! per-iteration protocol:
//!
//! 1. `CalcHash`, `Sort`
//! 2. `Reorder`, then swap pos/vel/info and take in the new counts
//! 3. `Forces`, then adopt the smallest reported timestep, capped at the
//!    configured one
//! 4. `Euler`, then swap pos/vel/info and advance the clock
//! 5. every `dump_every` iterations, `Dump` pos/vel/info to the host
//!
//! The stop flag is polled after every command. Once a stop is requested or
//! a limit is reached, a final `Dump` (unless the state was just dumped) and
//! then `Quit` are dispatched.

use std::time::Instant;

use fields::quantity::{Info, Pos, Vel};
use fields::BufferKey;

use crate::command::{Command, CommandFlags, CommandType};
use crate::config::RunConfig;
use crate::device::DeviceMap;
use crate::error::SimError;
use crate::global::GlobalData;
use crate::host_worker::{lattice, HostWorker, ParticleSeed};
use crate::stop::StopFlag;
use crate::worker::{DeviceWorker, WorkerPool, WorkerReport};

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `max_iterations` reached.
    MaxIterations,
    /// `max_time` reached.
    MaxTime,
    /// The stop flag was raised.
    StopRequested,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Completed iterations.
    pub iterations: u64,
    /// Simulated time.
    pub time: f64,
    /// Particles across the run at the end.
    pub total_particles: u64,
    /// Dump commands dispatched, the final one included.
    pub dumps: u64,
    /// Why the loop ended.
    pub reason: StopReason,
}

/// Iteration limits.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Limits {
    /// Stop after this many iterations.
    pub max_iterations: Option<u64>,
    /// Stop after this much simulated time.
    pub max_time: Option<f64>,
    /// Dump every N iterations (0 disables periodic dumps).
    pub dump_every: u64,
    /// Largest timestep allowed.
    pub max_dt: f32,
}

/// Coordinator plus workers.
pub struct Simulation {
    gdata: GlobalData,
    pool: WorkerPool,
    limits: Limits,
    dumps: u64,
}

impl Simulation {
    /// Assemble a simulation from a prepared coordinator and its workers.
    ///
    /// The per-device counts are taken from the workers, and the host
    /// buffers receive pos/vel/info for every local particle.
    pub fn new(
        mut gdata: GlobalData,
        workers: Vec<Box<dyn DeviceWorker>>,
        limits: Limits,
    ) -> Result<Self, SimError> {
        let counts: Vec<u32> = workers.iter().map(|w| w.particles()).collect();
        gdata.update_per_device_counts(&counts)?;
        let local: usize = counts.iter().map(|&n| n as usize).sum();
        let host = gdata.host_buffers_mut();
        if host.is_empty() {
            host.add::<Pos>()?.add::<Vel>()?.add::<Info>()?;
        }
        host.allocate_all(local)?;
        let pool = WorkerPool::spawn(workers)?;
        Ok(Self {
            gdata,
            pool,
            limits,
            dumps: 0,
        })
    }

    /// Build everything a run needs from its configuration: grid, device
    /// map, seeded host workers and the coordinator sharing `stop`.
    pub fn from_config(config: &RunConfig, stop: StopFlag) -> Result<Self, SimError> {
        config.validate()?;
        let grid = config.grid()?;
        let topology = config.topology()?;
        tracing::info!(
            "Grid {:?} ({} cells), {} device(s) on rank {}",
            grid.grid_size(),
            crate::format::add_separators(grid.n_grid_cells() as i64),
            topology.devices(),
            crate::format::rank_string(topology.rank(), topology.nodes())
        );

        let mut gdata = GlobalData::new(topology.clone(), grid, config.dt)
            .with_stop_flag(stop)
            .with_export(config.export_target());
        let map = DeviceMap::slabs(&grid, config.split_axis.index(), topology.total_devices());
        gdata.record_device_map(map)?;
        if config.save_device_map {
            gdata.dump_device_map("");
            if topology.is_multi_gpu() {
                gdata.dump_compact_device_maps("compact");
            }
        }

        let mut per_device: Vec<Vec<ParticleSeed>> = vec![Vec::new(); topology.devices()];
        for seed in lattice(&grid, config.deltap, config.particle_count) {
            match gdata.device_owning([seed.pos[0], seed.pos[1], seed.pos[2]]) {
                Some(id) if topology.is_local(id) => per_device[id.device()].push(seed),
                _ => {}
            }
        }

        let mut workers: Vec<Box<dyn DeviceWorker>> = Vec::with_capacity(topology.devices());
        for (device, seeds) in per_device.iter().enumerate() {
            let mut worker = HostWorker::new(device, config.particle_count, &grid, config.gravity)?;
            worker.load(seeds)?;
            workers.push(Box::new(worker));
        }

        let limits = Limits {
            max_iterations: config.max_iterations,
            max_time: config.max_time,
            dump_every: config.dump_every,
            max_dt: config.dt,
        };
        Self::new(gdata, workers, limits)
    }

    /// The coordinator.
    pub fn global(&self) -> &GlobalData {
        &self.gdata
    }

    /// Handle to the stop flag.
    pub fn stop_flag(&self) -> StopFlag {
        self.gdata.stop_flag()
    }

    fn dispatch(&mut self, command: Command) -> Result<Vec<WorkerReport>, SimError> {
        let ctx = self.gdata.issue_command(command)?;
        let reports = self.pool.run(ctx)?;
        self.gdata.complete_command(&reports)?;
        if command.kind == CommandType::Dump {
            self.dumps += 1;
        }
        Ok(reports)
    }

    /// Dispatch `command` and report whether the loop may go on.
    fn dispatch_step(&mut self, command: Command) -> Result<bool, SimError> {
        self.dispatch(command)?;
        Ok(!self.gdata.is_stop_requested())
    }

    /// Run one iteration. Returns `false` if a stop request cut it short.
    pub fn step(&mut self) -> Result<bool, SimError> {
        if !self.dispatch_step(Command::new(CommandType::CalcHash))? {
            return Ok(false);
        }
        if !self.dispatch_step(Command::new(CommandType::Sort))? {
            return Ok(false);
        }
        let reorder = self.dispatch_step(Command::new(CommandType::Reorder))?;
        self.gdata.swap_generation(BufferKey::POS_VEL_INFO)?;
        if !reorder {
            return Ok(false);
        }
        let forces = self.dispatch_step(
            Command::new(CommandType::Forces).with_flags(CommandFlags::INTEGRATOR_STEP_1),
        )?;
        let max_dt = self.limits.max_dt;
        let dt = self.gdata.take_min_dt().map_or(max_dt, |dt| dt.min(max_dt));
        self.gdata.set_dt(dt);
        if !forces {
            return Ok(false);
        }
        let dt = self.gdata.clock().dt;
        let euler = self.dispatch_step(
            Command::new(CommandType::Euler)
                .with_flags(CommandFlags::INTEGRATOR_STEP_1)
                .with_arg(dt),
        )?;
        self.gdata.swap_generation(BufferKey::POS_VEL_INFO)?;
        self.gdata.advance_clock();
        if !euler {
            return Ok(false);
        }

        let iterations = self.gdata.clock().iterations;
        if self.limits.dump_every > 0 && iterations % self.limits.dump_every == 0 {
            tracing::debug!(
                "Iteration {}: t={:.6}s, dt={:.3e}s",
                iterations,
                self.gdata.clock().time,
                dt
            );
            return self.dispatch_step(dump_command());
        }
        Ok(true)
    }

    fn limit_reached(&self) -> Option<StopReason> {
        let clock = self.gdata.clock();
        if self.limits.max_iterations.is_some_and(|max| clock.iterations >= max) {
            return Some(StopReason::MaxIterations);
        }
        if self.limits.max_time.is_some_and(|max| clock.time >= max) {
            return Some(StopReason::MaxTime);
        }
        None
    }

    /// Iterate until a limit is reached or a stop is requested, then dump
    /// and quit. The workers exit on `Quit`; the coordinator stays
    /// inspectable and refuses any further command.
    pub fn run(&mut self) -> Result<RunSummary, SimError> {
        let start_wall_time = Instant::now();
        let reason = loop {
            if self.gdata.is_stop_requested() {
                break StopReason::StopRequested;
            }
            if let Some(reason) = self.limit_reached() {
                break reason;
            }
            if !self.step()? {
                break StopReason::StopRequested;
            }
        };

        if self.gdata.last_command().kind != CommandType::Dump {
            self.dispatch(dump_command())?;
        }
        self.dispatch(Command::new(CommandType::Quit))?;
        let clock = self.gdata.clock();
        let summary = RunSummary {
            iterations: clock.iterations,
            time: clock.time,
            total_particles: self.gdata.total_particles(),
            dumps: self.dumps,
            reason,
        };
        tracing::info!(
            "Simulation finished ({:?}): {} iterations, {:.4}s simulated, \
             {} particles, wall_time={:.2}s",
            reason,
            summary.iterations,
            summary.time,
            crate::format::add_separators(summary.total_particles as i64),
            start_wall_time.elapsed().as_secs_f64()
        );
        Ok(summary)
    }

    /// Wait for every worker thread to exit.
    pub fn shutdown(self) -> Result<(), SimError> {
        let Simulation { pool, .. } = self;
        pool.join()?;
        Ok(())
    }
}

fn dump_command() -> Command {
    Command::new(CommandType::Dump)
        .with_buffers(BufferKey::POS_VEL_INFO)
        .with_flags(CommandFlags::DBLBUFFER_READ)
}
