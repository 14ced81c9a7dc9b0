//! Background sweeps that run beside the HTTP server.

use crate::config::Config;
use outpost_orchestrator::{JobReaper, LifecycleExecutor, WorkspaceOrchestrator};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How often the reaper looks for hung and unacknowledged jobs.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the lifecycle executor and the job reaper. Both stop when
/// `shutdown` fires.
pub fn start_background_tasks(
    orchestrator: &WorkspaceOrchestrator,
    config: &Config,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let executor = LifecycleExecutor::new(orchestrator.clone());
    let lifecycle = tokio::spawn(executor.run(config.autobuild_poll_interval(), shutdown.clone()));
    info!(
        "Lifecycle executor started (interval: {}s)",
        config.autobuild_poll_interval().as_secs()
    );

    let reaper = JobReaper::new(
        orchestrator.clone(),
        config.force_cancel_interval(),
        config.cancel_grace_period(),
    );
    let reaper = tokio::spawn(reaper.run(REAPER_INTERVAL, shutdown.clone()));
    info!(
        "Job reaper started (force cancel after {}s, grace {}s)",
        config.force_cancel_interval_secs, config.cancel_grace_period_secs
    );

    vec![lifecycle, reaper]
}
