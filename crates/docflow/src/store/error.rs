use thiserror::Error;

use super::model::JobStatus;
use crate::db::DatabaseError;
use crate::error::ValidationError;

/// Errors from job store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// A stored value could not be mapped back to a domain type.
    #[error("Corrupt record for job '{job_id}': {reason}")]
    Corrupt { job_id: String, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(DatabaseError::Sqlite(e))
    }
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
