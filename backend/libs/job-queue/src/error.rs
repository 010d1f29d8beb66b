//! Error types for the job queue library.

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobState;

/// Result type alias for queue operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors that can occur during queue operations.
#[derive(Error, Debug)]
pub enum JobError {
    /// Payload failed its kind's schema or validation; never enters the queue
    #[error("invalid payload for job kind '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },

    /// Enqueue options out of range (max attempts, queue name)
    #[error("invalid enqueue options: {0}")]
    InvalidOptions(String),

    /// Retry budget spent; the job was dead-lettered
    #[error("job {job_id} exceeded max attempts ({attempts}): {last_error}")]
    AttemptsExceeded {
        job_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    /// Job not found in the store
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    /// The caller no longer holds the lease (expired and recovered)
    #[error("Lease lost for job {0}")]
    LeaseLost(Uuid),

    /// Operation not allowed in the job's current state
    #[error("job {job_id} is {state:?}, operation requires {required}")]
    InvalidState {
        job_id: Uuid,
        state: JobState,
        required: &'static str,
    },

    /// Backend store failure
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Job queue error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<redis::RedisError> for JobError {
    fn from(e: redis::RedisError) -> Self {
        JobError::Backend(e.to_string())
    }
}

impl JobError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Backend(_))
    }
}
