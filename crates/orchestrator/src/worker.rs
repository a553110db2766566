//! Device worker contract and the thread pool driving the workers.
//!
//! Each local device gets one OS thread owning its [`DeviceWorker`]. The
//! coordinator publishes a [`StepContext`] to every thread through a channel
//! and then waits for one [`WorkerReport`] per device, so the send of a
//! command happens-before any worker sees it and every report is in hand
//! before the coordinator reads results.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use fields::{BufferKey, GridDecomposition};

use crate::command::{Command, CommandType};
use crate::device::{DeviceMap, Topology};
use crate::error::WorkerError;
use crate::generation::GenerationTable;

/// Everything a worker may read while executing one command.
///
/// Shared read-only between the worker threads for the duration of the
/// command.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Command to execute.
    pub command: Command,
    /// Generation indices in effect for this command.
    pub generations: GenerationTable,
    /// Grid geometry.
    pub grid: GridDecomposition,
    /// Cell ownership, once recorded.
    pub device_map: Option<Arc<DeviceMap>>,
    /// Run topology.
    pub topology: Topology,
    /// Completed iterations.
    pub iteration: u64,
    /// Simulated time.
    pub time: f64,
    /// Current timestep.
    pub dt: f32,
}

/// What one device hands back after a command.
///
/// Every field only describes the reporting device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    /// Local device index.
    pub device: usize,
    /// New number of particles held, after a count-updating command.
    pub particles: Option<u32>,
    /// Timestep estimate, after a force computation.
    pub dt: Option<f32>,
    /// Partial force on every rigid body.
    pub body_forces: Vec<[f32; 3]>,
    /// Partial torque on every rigid body.
    pub body_torques: Vec<[f32; 3]>,
    /// Raw bytes of the read generation of dumped buffers.
    pub dumped: Vec<(BufferKey, Vec<u8>)>,
}

impl WorkerReport {
    /// Empty report for `device`.
    pub fn new(device: usize) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }
}

/// A compute device able to execute coordinator commands.
///
/// The coordinator does not prescribe how a command is carried out, only
/// the context given before and the report expected after.
pub trait DeviceWorker: Send {
    /// Local device index.
    fn device(&self) -> usize;

    /// Number of particles currently held.
    fn particles(&self) -> u32;

    /// Execute one command.
    fn execute(&mut self, ctx: &StepContext) -> Result<WorkerReport, WorkerError>;
}

struct WorkerHandle {
    jobs: mpsc::Sender<Arc<StepContext>>,
    reports: mpsc::Receiver<Result<WorkerReport, WorkerError>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// One thread per device, released one command at a time.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Move every worker onto its own thread.
    pub fn spawn(workers: Vec<Box<dyn DeviceWorker>>) -> Result<Self, WorkerError> {
        let mut handles = Vec::with_capacity(workers.len());
        for mut worker in workers {
            let device = worker.device();
            let (job_tx, job_rx) = mpsc::channel::<Arc<StepContext>>();
            let (report_tx, report_rx) = mpsc::channel();
            let thread = thread::Builder::new()
                .name(format!("device-{}", device))
                .spawn(move || {
                    for ctx in job_rx {
                        let report = worker.execute(&ctx);
                        if report_tx.send(report).is_err() {
                            break;
                        }
                        if ctx.command.kind == CommandType::Quit {
                            break;
                        }
                    }
                    tracing::debug!("Device {} worker exiting", device);
                })
                .map_err(|source| WorkerError::Spawn { device, source })?;
            handles.push(WorkerHandle {
                jobs: job_tx,
                reports: report_rx,
                thread: Some(thread),
            });
        }
        tracing::info!("Started {} device workers", handles.len());
        Ok(Self { handles })
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if the pool has no worker.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Publish `ctx` to every worker and wait for all of them.
    ///
    /// Every worker is waited for even if one fails; the first error in
    /// device order is returned.
    pub fn run(&mut self, ctx: StepContext) -> Result<Vec<WorkerReport>, WorkerError> {
        let ctx = Arc::new(ctx);
        let mut sent = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            sent.push(handle.jobs.send(Arc::clone(&ctx)).is_ok());
        }

        let mut reports = Vec::with_capacity(self.handles.len());
        let mut first_error = None;
        for (device, (handle, sent)) in self.handles.iter().zip(sent).enumerate() {
            let result = if sent {
                handle
                    .reports
                    .recv()
                    .unwrap_or(Err(WorkerError::Disconnected(device)))
            } else {
                Err(WorkerError::Disconnected(device))
            };
            match result {
                Ok(report) => reports.push(report),
                Err(err) => {
                    tracing::error!("Device {} failed {}: {}", device, ctx.command.kind, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }

    /// Close every channel and wait for the threads to exit.
    pub fn join(mut self) -> Result<(), WorkerError> {
        self.join_all()
    }

    fn join_all(&mut self) -> Result<(), WorkerError> {
        let mut result = Ok(());
        for (device, handle) in self.handles.drain(..).enumerate() {
            drop(handle.jobs);
            if let Some(thread) = handle.thread {
                if thread.join().is_err() && result.is_ok() {
                    result = Err(WorkerError::Disconnected(device));
                }
            }
        }
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(err) = self.join_all() {
            tracing::warn!("Worker pool shutdown: {}", err);
        }
    }
}
