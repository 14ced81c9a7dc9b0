use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The returned token is cancelled when either arrives; the HTTP server and
/// background sweeps all watch it.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        cancel.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, falling back to ctrl-c");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = ctrl_c() => info!("Received SIGINT, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
    info!("Received ctrl-c, initiating graceful shutdown");
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
