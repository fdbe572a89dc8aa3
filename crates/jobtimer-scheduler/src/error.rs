//! Error types for the scheduler.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Repository error.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The job is due in the past and overdue jobs are not force-executed.
    #[error("invalid schedule time for job {job_id}: {due} is in the past")]
    InvalidScheduleTime { job_id: String, due: DateTime<Utc> },

    /// An execution callback referenced a job this scheduler does not know.
    #[error("job service error: {0}")]
    JobService(String),

    /// The trigger has no due time left.
    #[error("trigger has no next due time for job {0}")]
    InvalidTrigger(String),

    /// Invalid scheduler configuration.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// The timer primitive refused a registration.
    #[error("timer error: {0}")]
    Timer(String),
}

/// Errors raised by a [`JobRepository`](crate::JobRepository) backend.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The backend rejected a write because of a conflicting update.
    #[error("conflicting update for job {0}")]
    Conflict(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend is not reachable.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
