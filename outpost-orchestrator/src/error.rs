use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid {field}: {detail}")]
    Validation { field: String, detail: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Provider error: {0}")]
    Provider(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn validation(field: impl Into<String>, detail: impl ToString) -> Self {
        Self::Validation {
            field: field.into(),
            detail: detail.to_string(),
        }
    }

    /// Storage failures are transient; everything else is a decision the caller
    /// has to act on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

// SQLITE_CONSTRAINT_UNIQUE, SQLITE_BUSY_SNAPSHOT, SQLITE_LOCKED_SHAREDCACHE
const CONFLICT_CODES: [&str; 3] = ["2067", "517", "262"];

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let is_conflict = db_err.is_unique_violation()
                || db_err
                    .code()
                    .is_some_and(|code| CONFLICT_CODES.contains(&code.as_ref()));
            if is_conflict {
                return Self::Conflict(db_err.message().to_string());
            }
        }
        Self::Database(err)
    }
}
