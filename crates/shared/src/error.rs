//! Persistence errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique field (username) already exists
    #[error("Record already exists")]
    Conflict,
    #[error("Record not found")]
    NotFound,
    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;
