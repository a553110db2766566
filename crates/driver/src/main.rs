//! Simulation driver
//!
//! Loads a run configuration, starts one worker per local device and runs
//! the step protocol until a limit is reached or Ctrl-C is pressed. Ctrl-C
//! only raises the stop flag: the command in flight completes, then the
//! particle state is dumped and every worker is told to quit.

use std::process::ExitCode;

use orchestrator::{create_simulation, RunSummary, SimError, StopFlag};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driver=info,orchestrator=info,fields=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Config path from the first argument, then SPH_CONFIG
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SPH_CONFIG").ok())
        .unwrap_or_else(|| "configs/run.json".to_string());

    tracing::info!("Starting SPH driver with config {}", config_path);

    let stop = StopFlag::new();
    let sim = match create_simulation(&config_path, stop.clone()) {
        Ok(sim) => sim,
        Err(err) => {
            tracing::error!("Failed to set up simulation: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let signal_flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, stopping after the current command");
            signal_flag.request();
        }
    });

    let handle = tokio::task::spawn_blocking(move || -> Result<RunSummary, SimError> {
        let mut sim = sim;
        let summary = sim.run()?;
        sim.shutdown()?;
        Ok(summary)
    });

    match handle.await {
        Ok(Ok(summary)) => {
            tracing::info!(
                "Run complete: {} iterations, t = {:.6}s, {} particles ({:?})",
                summary.iterations,
                summary.time,
                summary.total_particles,
                summary.reason
            );
            ExitCode::SUCCESS
        }
        Ok(Err(err)) => {
            tracing::error!("Simulation failed: {}", err);
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!("Simulation thread panicked: {}", err);
            ExitCode::FAILURE
        }
    }
}
