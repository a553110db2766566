//! Process-wide coordination state.
//!
//! [`GlobalData`] is owned by the single coordinating thread. It is the only
//! authority for the current command, the generation indices, the particle
//! counts, the simulation clock and termination. Workers never see it
//! directly: they receive a [`StepContext`] snapshot with each command and
//! answer with a [`WorkerReport`] that only describes their own device.

use std::path::PathBuf;
use std::sync::Arc;

use fields::{BufferKey, BufferList, GridDecomposition};

use crate::command::{Command, CommandType};
use crate::device::{DeviceMap, GlobalDeviceId, Topology};
use crate::error::{SimError, StateError};
use crate::export::{self, ExportTarget};
use crate::format::{add_separators, rank_string};
use crate::generation::GenerationTable;
use crate::stop::StopFlag;
use crate::worker::{StepContext, WorkerReport};

/// Where the coordinator is in the step protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    /// No command in flight; the next one may be issued.
    Idle,
    /// A command was published and its reports are awaited.
    Dispatched(Command),
    /// `Quit` completed. Terminal.
    Quit,
}

/// Simulation clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clock {
    /// Completed iterations.
    pub iterations: u64,
    /// Simulated time.
    pub time: f64,
    /// Timestep of the next iteration.
    pub dt: f32,
}

/// Per-body accumulators, indexed `[device][body]`.
#[derive(Debug, Clone, Default, PartialEq)]
struct BodyPartials {
    forces: Vec<Vec<[f32; 3]>>,
    torques: Vec<Vec<[f32; 3]>>,
}

/// Shared coordination state of one process.
#[derive(Debug)]
pub struct GlobalData {
    topology: Topology,
    grid: GridDecomposition,
    device_map: Option<Arc<DeviceMap>>,
    generations: GenerationTable,
    phase: Phase,
    last_command: Command,
    particles_per_device: Vec<u32>,
    start_per_device: Vec<u32>,
    process_particles: Vec<u32>,
    clock: Clock,
    dts: Vec<Option<f32>>,
    bodies: BodyPartials,
    host: BufferList,
    stop: StopFlag,
    export: Option<ExportTarget>,
}

impl GlobalData {
    /// Fresh state for `topology` over `grid`, starting at `dt`.
    pub fn new(topology: Topology, grid: GridDecomposition, dt: f32) -> Self {
        let devices = topology.devices();
        let nodes = topology.nodes();
        Self {
            topology,
            grid,
            device_map: None,
            generations: GenerationTable::new(),
            phase: Phase::Idle,
            last_command: Command::default(),
            particles_per_device: vec![0; devices],
            start_per_device: vec![0; devices],
            process_particles: vec![0; nodes],
            clock: Clock {
                iterations: 0,
                time: 0.0,
                dt,
            },
            dts: vec![None; devices],
            bodies: BodyPartials {
                forces: vec![Vec::new(); devices],
                torques: vec![Vec::new(); devices],
            },
            host: BufferList::new(),
            stop: StopFlag::new(),
            export: None,
        }
    }

    /// Share an existing stop flag instead of the private one.
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Enable device-map export to `target`.
    pub fn with_export(mut self, target: ExportTarget) -> Self {
        self.export = Some(target);
        self
    }

    // ------------------------------------------------------------------
    // Topology and geometry
    // ------------------------------------------------------------------

    /// Run topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Grid geometry.
    pub fn grid(&self) -> &GridDecomposition {
        &self.grid
    }

    /// Local device count.
    pub fn devices(&self) -> usize {
        self.topology.devices()
    }

    /// `"<rank>.<nodes>"` of this process.
    pub fn rank_string(&self) -> String {
        rank_string(self.topology.rank(), self.topology.nodes())
    }

    // ------------------------------------------------------------------
    // Command protocol
    // ------------------------------------------------------------------

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether `Quit` has completed.
    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Quit
    }

    /// Last command issued.
    pub fn last_command(&self) -> Command {
        self.last_command
    }

    /// Publish `command` and return the context workers execute it with.
    ///
    /// Fails if a command is still in flight or the coordinator has quit.
    pub fn issue_command(&mut self, command: Command) -> Result<StepContext, StateError> {
        match self.phase {
            Phase::Quit => return Err(StateError::Terminated),
            Phase::Dispatched(pending) => {
                return Err(StateError::CommandInFlight {
                    requested: command.kind,
                    pending: pending.kind,
                })
            }
            Phase::Idle => {}
        }
        self.phase = Phase::Dispatched(command);
        self.last_command = command;
        Ok(self.context(command))
    }

    fn context(&self, command: Command) -> StepContext {
        StepContext {
            command,
            generations: self.generations.clone(),
            grid: self.grid,
            device_map: self.device_map.clone(),
            topology: self.topology.clone(),
            iteration: self.clock.iterations,
            time: self.clock.time,
            dt: self.clock.dt,
        }
    }

    /// Take in the reports of every local device for the command in flight
    /// and return to idle, or to the terminal state after `Quit`.
    ///
    /// Exactly one report per local device is expected. Everything is
    /// checked before any state changes, so a rejected completion leaves
    /// counts, timesteps, body partials, host buffers and the phase as they
    /// were.
    ///
    /// Counts are rewritten only for count-updating commands. Timestep
    /// estimates are taken whenever present. A body reduction rewrites the
    /// partials of every device, other commands only those of devices that
    /// report some. Dumped bytes are gathered into the host buffers at each
    /// device's start offset.
    pub fn complete_command(&mut self, reports: &[WorkerReport]) -> Result<(), SimError> {
        let command = match self.phase {
            Phase::Dispatched(command) => command,
            Phase::Idle | Phase::Quit => return Err(StateError::NoCommandInFlight.into()),
        };
        self.check_reports(reports)?;

        let recount =
            command.kind.updates_counts() && reports.iter().any(|r| r.particles.is_some());
        let new_counts = if recount {
            let mut counts = self.particles_per_device.clone();
            for report in reports {
                if let Some(n) = report.particles {
                    counts[report.device] = n;
                }
            }
            let (start, _) = prefix_offsets(&counts)?;
            Some((counts, start))
        } else {
            None
        };
        let start = new_counts
            .as_ref()
            .map_or(self.start_per_device.as_slice(), |(_, start)| start.as_slice());
        for report in reports {
            self.check_dump(report, start[report.device] as usize)?;
        }

        if let Some((counts, _)) = new_counts {
            self.update_per_device_counts(&counts)?;
        }
        let reduction = command.kind == CommandType::ReduceBodiesForces;
        for report in reports {
            if let Some(dt) = report.dt {
                self.dts[report.device] = Some(dt);
            }
            if reduction || !report.body_forces.is_empty() || !report.body_torques.is_empty() {
                self.bodies.forces[report.device] = report.body_forces.clone();
                self.bodies.torques[report.device] = report.body_torques.clone();
            }
            if !report.dumped.is_empty() {
                self.gather_dump(report)?;
            }
        }

        self.phase = if command.kind == CommandType::Quit {
            tracing::info!(
                "Quit completed at iteration {}, t = {:.6}",
                self.clock.iterations,
                self.clock.time
            );
            Phase::Quit
        } else {
            Phase::Idle
        };
        Ok(())
    }

    /// One report per local device, none outside the node.
    fn check_reports(&self, reports: &[WorkerReport]) -> Result<(), StateError> {
        let devices = self.devices();
        let mut seen = vec![false; devices];
        for report in reports {
            let slot = seen
                .get_mut(report.device)
                .ok_or(StateError::UnknownDevice {
                    device: report.device,
                    devices,
                })?;
            if *slot {
                return Err(StateError::DuplicateReport(report.device));
            }
            *slot = true;
        }
        match seen.iter().position(|reported| !reported) {
            Some(device) => Err(StateError::MissingReport(device)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Generations
    // ------------------------------------------------------------------

    /// Generation indices.
    pub fn generations(&self) -> &GenerationTable {
        &self.generations
    }

    /// Exchange read and write for the double-buffered keys in `keys`.
    ///
    /// Only allowed while no command is in flight.
    pub fn swap_generation(&mut self, keys: BufferKey) -> Result<BufferKey, StateError> {
        match self.phase {
            Phase::Dispatched(pending) => Err(StateError::StepInProgress(pending.kind)),
            Phase::Quit => Err(StateError::Terminated),
            Phase::Idle => Ok(self.generations.swap(keys)),
        }
    }

    // ------------------------------------------------------------------
    // Stop request
    // ------------------------------------------------------------------

    /// Request a graceful stop.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Handle to the stop flag, for an asynchronous requester.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    // ------------------------------------------------------------------
    // Device map
    // ------------------------------------------------------------------

    /// Install the cell ownership map. Allowed once.
    ///
    /// Maps holding linear device numbers are converted to global device ids.
    pub fn record_device_map(&mut self, mut map: DeviceMap) -> Result<(), StateError> {
        if self.device_map.is_some() {
            return Err(StateError::DeviceMapAlreadyRecorded);
        }
        if map.len() != self.grid.n_grid_cells() {
            return Err(StateError::DeviceMapSize {
                expected: self.grid.n_grid_cells(),
                got: map.len(),
            });
        }
        map.convert_to_global(self.topology.devices());
        for device in 0..self.devices() {
            let id = self.topology.global_id(device);
            tracing::debug!("Device {} owns {} cells", id, map.cells_owned_by(id));
        }
        tracing::info!("Device map recorded for {} cells", map.len());
        self.device_map = Some(Arc::new(map));
        Ok(())
    }

    /// The installed device map.
    pub fn device_map(&self) -> Option<&DeviceMap> {
        self.device_map.as_deref()
    }

    /// Device owning the cell of `pos`.
    ///
    /// Single-device runs always answer device 0 without any lookup.
    /// Otherwise the clamped cell hash is looked up in the device map;
    /// `None` if no map has been recorded yet.
    #[inline]
    pub fn device_owning(&self, pos: [f32; 3]) -> Option<GlobalDeviceId> {
        if !self.topology.is_multi_device() {
            return Some(GlobalDeviceId::default());
        }
        let hash = self.grid.hash_of(pos);
        self.device_map.as_ref()?.owner(hash)
    }

    /// Write the device map of this process to the export target.
    ///
    /// Best effort: failures are logged and `None` is returned.
    pub fn dump_device_map(&self, prefix: &str) -> Option<PathBuf> {
        let target = self.export.as_ref()?;
        let map = self.device_map.as_ref()?;
        match export::save_device_map(target, prefix, &self.grid, map, &self.topology) {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!("Failed to save device map: {}", err);
                None
            }
        }
    }

    /// Write the compact map of every local device. Best effort, like
    /// [`dump_device_map`](Self::dump_device_map).
    pub fn dump_compact_device_maps(&self, prefix: &str) -> Vec<PathBuf> {
        let (Some(target), Some(map)) = (self.export.as_ref(), self.device_map.as_ref()) else {
            return Vec::new();
        };
        let devices = self.devices();
        (0..devices)
            .filter_map(|device| {
                let compact = map.compact_for(&self.grid, self.topology.global_id(device));
                let saved = export::save_compact_device_map(
                    target, prefix, &self.grid, &compact, device, devices,
                );
                match saved {
                    Ok(path) => Some(path),
                    Err(err) => {
                        tracing::warn!("Failed to save compact map of device {}: {}", device, err);
                        None
                    }
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Particle counts
    // ------------------------------------------------------------------

    /// Overwrite the particle count of every local device.
    ///
    /// Start offsets are rebuilt as prefix sums and this node's share is set
    /// to the sum; the global total is always derived from the node shares.
    pub fn update_per_device_counts(&mut self, counts: &[u32]) -> Result<(), StateError> {
        if counts.len() != self.devices() {
            return Err(StateError::DeviceCount {
                expected: self.devices(),
                got: counts.len(),
            });
        }
        let (start, total) = prefix_offsets(counts)?;
        self.start_per_device = start;
        self.particles_per_device.copy_from_slice(counts);
        self.process_particles[self.topology.rank()] = total;
        tracing::debug!(
            "Rank {} holds {} particles",
            self.rank_string(),
            add_separators(total as i64)
        );
        Ok(())
    }

    /// Set the particle share of another node, as received over the network.
    pub fn set_process_particles(&mut self, rank: usize, particles: u32) -> Result<(), StateError> {
        let nodes = self.topology.nodes();
        let slot = self
            .process_particles
            .get_mut(rank)
            .ok_or(StateError::UnknownDevice {
                device: rank,
                devices: nodes,
            })?;
        *slot = particles;
        Ok(())
    }

    /// Particles held by each local device.
    pub fn particles_per_device(&self) -> &[u32] {
        &self.particles_per_device
    }

    /// Offset of each local device's particles in host arrays.
    pub fn start_per_device(&self) -> &[u32] {
        &self.start_per_device
    }

    /// Particles held by each node.
    pub fn process_particles(&self) -> &[u32] {
        &self.process_particles
    }

    /// Particles across the whole run.
    pub fn total_particles(&self) -> u64 {
        self.process_particles.iter().map(|&n| n as u64).sum()
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    /// Simulation clock.
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Smallest timestep estimate reported since the last call, if any.
    ///
    /// Consumes the estimates.
    pub fn take_min_dt(&mut self) -> Option<f32> {
        let min = self
            .dts
            .iter()
            .flatten()
            .copied()
            .fold(None, |acc: Option<f32>, dt| Some(acc.map_or(dt, |m| m.min(dt))));
        self.dts.iter_mut().for_each(|dt| *dt = None);
        min
    }

    /// Set the timestep of the next iteration.
    pub fn set_dt(&mut self, dt: f32) {
        self.clock.dt = dt;
    }

    /// Account one completed iteration of `dt`.
    pub fn advance_clock(&mut self) {
        self.clock.time += self.clock.dt as f64;
        self.clock.iterations += 1;
    }

    // ------------------------------------------------------------------
    // Rigid bodies
    // ------------------------------------------------------------------

    /// Sum of force and torque on every body over all local devices.
    pub fn body_totals(&self) -> Vec<([f32; 3], [f32; 3])> {
        let bodies = self
            .bodies
            .forces
            .iter()
            .chain(&self.bodies.torques)
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        let mut totals = vec![([0.0; 3], [0.0; 3]); bodies];
        for (forces, torques) in self.bodies.forces.iter().zip(&self.bodies.torques) {
            for (total, f) in totals.iter_mut().zip(forces) {
                add3(&mut total.0, f);
            }
            for (total, t) in totals.iter_mut().zip(torques) {
                add3(&mut total.1, t);
            }
        }
        totals
    }

    // ------------------------------------------------------------------
    // Host snapshot
    // ------------------------------------------------------------------

    /// Host-side buffers receiving dumps.
    pub fn host_buffers(&self) -> &BufferList {
        &self.host
    }

    /// Mutable host-side buffers, to add and allocate quantities.
    pub fn host_buffers_mut(&mut self) -> &mut BufferList {
        &mut self.host
    }

    fn check_dump(&self, report: &WorkerReport, start: usize) -> Result<(), StateError> {
        for (key, count, _) in dump_ranges(&self.host, report)? {
            if self.host.byte_range(key, 0, start, count).is_none() {
                return Err(StateError::HostSnapshot {
                    device: report.device,
                    key,
                });
            }
        }
        Ok(())
    }

    fn gather_dump(&mut self, report: &WorkerReport) -> Result<(), StateError> {
        let start = self.start_per_device[report.device] as usize;
        for (key, count, bytes) in dump_ranges(&self.host, report)? {
            let dest = self
                .host
                .byte_range_mut(key, 0, start, count)
                .ok_or(StateError::HostSnapshot {
                    device: report.device,
                    key,
                })?;
            dest.copy_from_slice(bytes);
        }
        Ok(())
    }
}

/// Key, element count and bytes of every buffer dumped in `report`.
fn dump_ranges<'a>(
    host: &BufferList,
    report: &'a WorkerReport,
) -> Result<Vec<(BufferKey, usize, &'a [u8])>, StateError> {
    report
        .dumped
        .iter()
        .map(|(key, bytes)| match host.element_size(*key) {
            Some(size) if size > 0 && bytes.len() % size == 0 => {
                Ok((*key, bytes.len() / size, bytes.as_slice()))
            }
            _ => Err(StateError::HostSnapshot {
                device: report.device,
                key: *key,
            }),
        })
        .collect()
}

/// Start offset of every device and the sum of `counts`.
fn prefix_offsets(counts: &[u32]) -> Result<(Vec<u32>, u32), StateError> {
    let mut start = Vec::with_capacity(counts.len());
    let mut total = 0u32;
    for &n in counts {
        start.push(total);
        total = total
            .checked_add(n)
            .ok_or_else(|| StateError::ParticleCountOverflow(counts.to_vec()))?;
    }
    Ok((start, total))
}

fn add3(acc: &mut [f32; 3], v: &[f32; 3]) {
    for axis in 0..3 {
        acc[axis] += v[axis];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fields::quantity::Pos;

    fn grid() -> GridDecomposition {
        GridDecomposition::from_cells([0.0; 3], [1.0; 3], [4, 4, 4]).unwrap()
    }

    fn two_devices() -> GlobalData {
        GlobalData::new(Topology::new(2, 1, 0).unwrap(), grid(), 1e-3)
    }

    fn report(device: usize) -> WorkerReport {
        WorkerReport::new(device)
    }

    #[test]
    fn issue_then_complete_returns_to_idle() {
        let mut gdata = two_devices();
        let ctx = gdata.issue_command(Command::new(CommandType::CalcHash)).unwrap();
        assert_eq!(ctx.command.kind, CommandType::CalcHash);
        assert!(matches!(gdata.phase(), Phase::Dispatched(_)));
        gdata.complete_command(&[report(0), report(1)]).unwrap();
        assert_eq!(gdata.phase(), Phase::Idle);
    }

    #[test]
    fn second_issue_while_in_flight_fails() {
        let mut gdata = two_devices();
        gdata.issue_command(Command::new(CommandType::Dump)).unwrap();
        let err = gdata.issue_command(Command::new(CommandType::Quit)).unwrap_err();
        assert_eq!(
            err,
            StateError::CommandInFlight {
                requested: CommandType::Quit,
                pending: CommandType::Dump
            }
        );
    }

    #[test]
    fn complete_without_command_fails() {
        let mut gdata = two_devices();
        assert!(matches!(
            gdata.complete_command(&[]),
            Err(SimError::State(StateError::NoCommandInFlight))
        ));
    }

    #[test]
    fn swap_refused_mid_step() {
        let mut gdata = two_devices();
        gdata.issue_command(Command::new(CommandType::Euler)).unwrap();
        assert_eq!(
            gdata.swap_generation(BufferKey::POS),
            Err(StateError::StepInProgress(CommandType::Euler))
        );
        gdata.complete_command(&[report(0), report(1)]).unwrap();
        assert_eq!(gdata.swap_generation(BufferKey::POS), Ok(BufferKey::POS));
        assert_eq!(gdata.generations().read_index(BufferKey::POS), 1);
    }

    #[test]
    fn counts_rebuild_offsets_and_total() {
        let mut gdata = two_devices();
        gdata.update_per_device_counts(&[30, 12]).unwrap();
        assert_eq!(gdata.start_per_device(), &[0, 30]);
        assert_eq!(gdata.total_particles(), 42);
        assert!(gdata.update_per_device_counts(&[1]).is_err());
    }

    #[test]
    fn reorder_reports_update_counts() {
        let mut gdata = two_devices();
        gdata.update_per_device_counts(&[5, 5]).unwrap();
        gdata.issue_command(Command::new(CommandType::Reorder)).unwrap();
        let mut r1 = report(1);
        r1.particles = Some(7);
        gdata.complete_command(&[report(0), r1]).unwrap();
        assert_eq!(gdata.particles_per_device(), &[5, 7]);
        assert_eq!(gdata.total_particles(), 12);
    }

    #[test]
    fn forces_reports_ignore_counts() {
        let mut gdata = two_devices();
        gdata.issue_command(Command::new(CommandType::Forces)).unwrap();
        let mut r0 = report(0);
        r0.particles = Some(99);
        r0.dt = Some(2e-4);
        let mut r1 = report(1);
        r1.dt = Some(1e-4);
        gdata.complete_command(&[r0, r1]).unwrap();
        assert_eq!(gdata.total_particles(), 0);
        assert_eq!(gdata.take_min_dt(), Some(1e-4));
        assert_eq!(gdata.take_min_dt(), None);
    }

    #[test]
    fn unknown_device_report_rejected() {
        let mut gdata = two_devices();
        gdata.issue_command(Command::new(CommandType::Idle)).unwrap();
        assert!(matches!(
            gdata.complete_command(&[report(2)]),
            Err(SimError::State(StateError::UnknownDevice { device: 2, .. }))
        ));
    }

    #[test]
    fn body_totals_sum_devices() {
        let mut gdata = two_devices();
        gdata.issue_command(Command::new(CommandType::ReduceBodiesForces)).unwrap();
        let mut r0 = report(0);
        r0.body_forces = vec![[1.0, 0.0, 0.0], [0.0, 2.0, 0.0]];
        r0.body_torques = vec![[0.0; 3], [0.0; 3]];
        let mut r1 = report(1);
        r1.body_forces = vec![[1.0, 1.0, 0.0], [0.0, 0.0, 3.0]];
        r1.body_torques = vec![[0.5, 0.0, 0.0], [0.0; 3]];
        gdata.complete_command(&[r0, r1]).unwrap();
        let totals = gdata.body_totals();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0], ([2.0, 1.0, 0.0], [0.5, 0.0, 0.0]));
        assert_eq!(totals[1].0, [0.0, 2.0, 3.0]);
    }

    #[test]
    fn body_reduction_rewrites_every_device() {
        let mut gdata = two_devices();
        let reduce = Command::new(CommandType::ReduceBodiesForces);

        gdata.issue_command(reduce).unwrap();
        let mut r0 = report(0);
        r0.body_forces = vec![[1.0, 0.0, 0.0]];
        r0.body_torques = vec![[0.0; 3]];
        let mut r1 = report(1);
        r1.body_forces = vec![[5.0, 0.0, 0.0]];
        r1.body_torques = vec![[0.0, 0.0, 2.0]];
        gdata.complete_command(&[r0.clone(), r1]).unwrap();
        assert_eq!(gdata.body_totals(), vec![([6.0, 0.0, 0.0], [0.0, 0.0, 2.0])]);

        // device 1 no longer holds any body particle
        gdata.issue_command(reduce).unwrap();
        gdata.complete_command(&[r0, report(1)]).unwrap();
        assert_eq!(gdata.body_totals(), vec![([1.0, 0.0, 0.0], [0.0; 3])]);

        // other commands leave the partials alone
        gdata.issue_command(Command::new(CommandType::Forces)).unwrap();
        gdata.complete_command(&[report(0), report(1)]).unwrap();
        assert_eq!(gdata.body_totals().len(), 1);
    }

    #[test]
    fn device_map_recorded_once_and_converted() {
        let mut gdata = two_devices();
        let map = DeviceMap::slabs(gdata.grid(), 0, 2);
        gdata.record_device_map(map.clone()).unwrap();
        assert_eq!(
            gdata.record_device_map(map),
            Err(StateError::DeviceMapAlreadyRecorded)
        );
        assert_eq!(gdata.device_owning([3.5, 0.5, 0.5]), Some(GlobalDeviceId::new(0, 1)));
        assert_eq!(gdata.device_owning([0.5, 3.5, 3.5]), Some(GlobalDeviceId::new(0, 0)));
    }

    #[test]
    fn device_map_size_checked() {
        let mut gdata = two_devices();
        assert_eq!(
            gdata.record_device_map(DeviceMap::from_global(vec![0; 10])),
            Err(StateError::DeviceMapSize {
                expected: 64,
                got: 10
            })
        );
        assert_eq!(gdata.device_owning([0.5; 3]), None);
    }

    #[test]
    fn single_device_owns_everything() {
        let gdata = GlobalData::new(Topology::single(), grid(), 1e-3);
        assert_eq!(gdata.device_owning([100.0; 3]), Some(GlobalDeviceId::default()));
    }

    #[test]
    fn dump_gathers_at_start_offsets() {
        let mut gdata = two_devices();
        gdata.host_buffers_mut().add::<Pos>().unwrap();
        gdata.host_buffers_mut().allocate_all(3).unwrap();
        gdata.update_per_device_counts(&[1, 2]).unwrap();

        gdata.issue_command(Command::new(CommandType::Dump)).unwrap();
        let mut r0 = report(0);
        r0.dumped = vec![(BufferKey::POS, bytemuck::cast_slice(&[[1.0f32; 4]]).to_vec())];
        let mut r1 = report(1);
        r1.dumped = vec![(
            BufferKey::POS,
            bytemuck::cast_slice(&[[2.0f32; 4], [3.0f32; 4]]).to_vec(),
        )];
        gdata.complete_command(&[r0, r1]).unwrap();

        let pos = gdata.host_buffers().data::<Pos>(0).unwrap();
        assert_eq!(pos, &[[1.0; 4], [2.0; 4], [3.0; 4]]);
    }

    #[test]
    fn dump_overflowing_host_fails() {
        let mut gdata = two_devices();
        gdata.host_buffers_mut().add::<Pos>().unwrap();
        gdata.host_buffers_mut().allocate_all(1).unwrap();
        gdata.update_per_device_counts(&[1, 1]).unwrap();
        gdata.issue_command(Command::new(CommandType::Dump)).unwrap();
        let mut r1 = report(1);
        r1.dumped = vec![(BufferKey::POS, vec![0; 16])];
        assert!(matches!(
            gdata.complete_command(&[report(0), r1]),
            Err(SimError::State(StateError::HostSnapshot { device: 1, .. }))
        ));
    }

    #[test]
    fn rejected_dump_leaves_state_untouched() {
        let mut gdata = two_devices();
        gdata.host_buffers_mut().add::<Pos>().unwrap();
        gdata.host_buffers_mut().allocate_all(2).unwrap();
        gdata.update_per_device_counts(&[1, 1]).unwrap();
        gdata.issue_command(Command::new(CommandType::Dump)).unwrap();

        // device 0 fits, device 1 overruns the host buffer
        let mut r0 = report(0);
        r0.dt = Some(5e-5);
        r0.dumped = vec![(BufferKey::POS, bytemuck::cast_slice(&[[7.0f32; 4]]).to_vec())];
        let mut r1 = report(1);
        r1.dumped = vec![(BufferKey::POS, vec![0; 32])];
        assert!(gdata.complete_command(&[r0, r1]).is_err());

        assert!(matches!(gdata.phase(), Phase::Dispatched(_)));
        assert_eq!(gdata.take_min_dt(), None);
        assert_eq!(gdata.host_buffers().data::<Pos>(0).unwrap()[0], [0.0; 4]);
    }

    #[test]
    fn reports_must_cover_each_device_once() {
        let mut gdata = two_devices();
        gdata.update_per_device_counts(&[4, 6]).unwrap();
        gdata.issue_command(Command::new(CommandType::Reorder)).unwrap();
        let mut r0 = report(0);
        r0.particles = Some(9);

        let attempts = [
            (vec![], StateError::MissingReport(0)),
            (vec![r0.clone()], StateError::MissingReport(1)),
            (vec![r0.clone(), r0.clone()], StateError::DuplicateReport(0)),
            (
                vec![r0.clone(), report(1), report(2)],
                StateError::UnknownDevice {
                    device: 2,
                    devices: 2,
                },
            ),
        ];
        for (reports, expected) in attempts {
            match gdata.complete_command(&reports) {
                Err(SimError::State(err)) => assert_eq!(err, expected),
                other => panic!("expected {expected:?}, got {other:?}"),
            }
            assert_eq!(gdata.particles_per_device(), &[4, 6]);
            assert_eq!(gdata.start_per_device(), &[0, 4]);
            assert!(matches!(gdata.phase(), Phase::Dispatched(_)));
        }

        gdata.complete_command(&[r0, report(1)]).unwrap();
        assert_eq!(gdata.particles_per_device(), &[9, 6]);
        assert_eq!(gdata.phase(), Phase::Idle);
    }

    #[test]
    fn count_overflow_is_rejected() {
        let mut gdata = two_devices();
        gdata.update_per_device_counts(&[3, 4]).unwrap();
        assert_eq!(
            gdata.update_per_device_counts(&[u32::MAX, 1]),
            Err(StateError::ParticleCountOverflow(vec![u32::MAX, 1]))
        );
        assert_eq!(gdata.particles_per_device(), &[3, 4]);
        assert_eq!(gdata.total_particles(), 7);

        gdata.issue_command(Command::new(CommandType::Crop)).unwrap();
        let mut r0 = report(0);
        r0.particles = Some(u32::MAX);
        assert!(matches!(
            gdata.complete_command(&[r0, report(1)]),
            Err(SimError::State(StateError::ParticleCountOverflow(_)))
        ));
        assert_eq!(gdata.start_per_device(), &[0, 3]);
    }

    #[test]
    fn clock_advances() {
        let mut gdata = two_devices();
        gdata.advance_clock();
        gdata.set_dt(2e-3);
        gdata.advance_clock();
        let clock = gdata.clock();
        assert_eq!(clock.iterations, 2);
        assert!((clock.time - 3e-3).abs() < 1e-9);
    }

    #[test]
    fn process_particles_of_other_ranks() {
        let mut gdata = GlobalData::new(Topology::new(1, 2, 0).unwrap(), grid(), 1e-3);
        gdata.update_per_device_counts(&[10]).unwrap();
        gdata.set_process_particles(1, 15).unwrap();
        assert_eq!(gdata.total_particles(), 25);
        assert!(gdata.set_process_particles(2, 1).is_err());
        assert_eq!(gdata.rank_string(), "0.2");
    }
}
