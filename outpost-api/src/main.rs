use anyhow::Result;
use outpost_api::{create_app, install_shutdown_handler, start_background_tasks, AppState, Config};
use outpost_orchestrator::db::{backup_database, create_pool, run_migrations};
use outpost_orchestrator::WorkspaceOrchestrator;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Held for the life of the process so buffered file logs get flushed
    let _log_guard = outpost_logging::init_subscriber();

    info!("Starting outpost-api service...");

    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, admins={}",
        config.bind_addr,
        config.db_path.display(),
        config.admins.len()
    );
    if config.provisioner_psk.is_none() {
        info!("OUTPOST_PROVISIONER_PSK not set, accepting any provisioner daemon");
    }

    // Database setup
    let db_path = &config.db_path;

    // Backup before migrations
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let orchestrator =
        WorkspaceOrchestrator::new(pool).with_default_quota_budget(config.default_quota_budget);

    let shutdown = install_shutdown_handler();
    let tasks = start_background_tasks(&orchestrator, &config, &shutdown);

    let app = create_app(AppState::from_config(orchestrator, &config));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    for task in tasks {
        task.await.ok();
    }
    info!("outpost-api stopped");

    Ok(())
}
