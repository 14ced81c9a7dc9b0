use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

/// Initialize database connection pool
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Opens a transaction holding the write lock from its first statement.
///
/// A deferred transaction that read first cannot upgrade its lock after
/// another writer commits and fails with `SQLITE_BUSY`; an immediate one
/// waits out the busy timeout and then reads the winner's rows.
pub(crate) async fn begin_immediate(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Backup database before migrations (returns backup path)
pub fn backup_database(db_path: &Path) -> Result<std::path::PathBuf> {
    let timestamp = Utc::now().timestamp();

    let backup_path = db_path.with_extension(format!("db.backup.{}", timestamp));

    if db_path.exists() {
        std::fs::copy(db_path, &backup_path)?;
    }

    Ok(backup_path)
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
