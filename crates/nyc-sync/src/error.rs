use std::path::PathBuf;

use nyc_adapters::AdapterError;
use nyc_core::SyncDomain;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A cached input was missing; raised before anything is deleted.
    #[error("cached file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error(transparent)]
    Source(AdapterError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0} sync already in progress")]
    InProgress(SyncDomain),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::MissingFile(path) => Self::NotFound(path),
            other => Self::Source(other),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
