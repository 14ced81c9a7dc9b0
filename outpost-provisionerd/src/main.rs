use anyhow::Result;
use clap::Parser;
use outpost_orchestrator::provisionerd::{DaemonOptions, ProvisionerDaemonRunner};
use outpost_provisionerd::{ClientConfig, EchoProvisioner, RemoteProvisionerApi};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "outpost-provisionerd")]
#[command(about = "Runs workspace build jobs handed out by an Outpost server")]
#[command(version)]
struct Args {
    /// Server base URL
    #[arg(long, env = "OUTPOST_URL", default_value = "http://127.0.0.1:3121")]
    url: String,

    /// Daemon name; reconnecting with the same name reuses the registration
    #[arg(long, env = "OUTPOST_PROVISIONER_NAME", default_value = "provisionerd")]
    name: String,

    /// Capabilities this daemon offers (comma-separated)
    #[arg(long, env = "OUTPOST_PROVISIONER_TAGS", value_delimiter = ',')]
    tags: Vec<String>,

    /// Pre-shared key expected by the server
    #[arg(long, env = "OUTPOST_PROVISIONER_PSK", hide_env_values = true)]
    psk: Option<String>,

    /// Delay between empty acquires, in milliseconds
    #[arg(long, env = "OUTPOST_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Random extra delay added to each poll, in milliseconds
    #[arg(long, env = "OUTPOST_POLL_JITTER_MS", default_value_t = 100)]
    poll_jitter_ms: u64,

    /// How often progress is reported while a job runs, in milliseconds
    #[arg(long, env = "OUTPOST_UPDATE_INTERVAL_MS", default_value_t = 1000)]
    update_interval_ms: u64,

    /// Simulated apply time of the echo provisioner, in milliseconds
    #[arg(long, env = "OUTPOST_ECHO_DELAY_MS", default_value_t = 0)]
    echo_delay_ms: u64,

    /// Daily cost reported for each started workspace
    #[arg(long, env = "OUTPOST_ECHO_DAILY_COST", default_value_t = 0)]
    echo_daily_cost: i64,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.url.clone(),
            name: self.name.clone(),
            tags: self.tags.iter().filter(|t| !t.trim().is_empty()).cloned().collect(),
            psk: self.psk.clone(),
        }
    }

    fn daemon_options(&self) -> DaemonOptions {
        DaemonOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_jitter: Duration::from_millis(self.poll_jitter_ms),
            update_interval: Duration::from_millis(self.update_interval_ms.max(1)),
            ..DaemonOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = outpost_logging::init_subscriber();
    let args = Args::parse();

    let config = args.client_config();
    // Fail fast on a bad URL instead of retrying forever
    config.serve_url()?;

    let provisioner = Arc::new(
        EchoProvisioner::new()
            .with_delay(Duration::from_millis(args.echo_delay_ms))
            .with_daily_cost(args.echo_daily_cost),
    );
    let options = args.daemon_options();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let mut delay = options.poll_interval.max(Duration::from_millis(100));
    while !shutdown.is_cancelled() {
        match RemoteProvisionerApi::connect(&config).await {
            Ok(api) => {
                delay = options.poll_interval.max(Duration::from_millis(100));
                let api = Arc::new(api);

                // Stop the loop when either the process or the connection ends
                let session = shutdown.child_token();
                let watcher = tokio::spawn({
                    let closed = api.closed().clone();
                    let session = session.clone();
                    async move {
                        closed.cancelled().await;
                        session.cancel();
                    }
                });

                ProvisionerDaemonRunner::new(Arc::clone(&api), Arc::clone(&provisioner), options.clone())
                    .run(session)
                    .await;
                watcher.abort();

                if shutdown.is_cancelled() {
                    if let Ok(api) = Arc::try_unwrap(api) {
                        api.close().await;
                    }
                    break;
                }
                warn!("connection lost, reconnecting");
            }
            Err(e) => warn!(error = %e, retry_in = ?delay, "failed to connect"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }

    info!("outpost-provisionerd stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
