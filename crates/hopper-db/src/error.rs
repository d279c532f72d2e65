//! Database error types.

use hopper_core::{Error, JobId, JobState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate job id: {0}")]
    DuplicateJob(JobId),

    #[error("illegal transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => Error::NotFound(what),
            DbError::DuplicateJob(id) => Error::DuplicateId(id),
            DbError::InvalidTransition { .. } | DbError::Corrupt(_) => {
                Error::InvalidInput(err.to_string())
            }
            DbError::Database(_) | DbError::Migration(_) => {
                Error::StoreUnavailable(err.to_string())
            }
        }
    }
}
