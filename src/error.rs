//! Error types for Apiary
//!
//! Centralized error handling using thiserror. The first group of variants are the
//! scheduling-engine failure kinds; the rest wrap lookups and foreign errors.

use thiserror::Error;

/// All error types that can occur in Apiary
#[derive(Debug, Error)]
pub enum ApiaryError {
    /// Another worker claimed the job first. Callers move on to the next job.
    #[error("Claim conflict on job {0}")]
    ClaimConflict(i64),

    /// The job failed and was put back to READY
    #[error("Job {job_id} failed (attempt {retry_count}), requeued: {message}")]
    RetryableJobFailure {
        job_id: i64,
        retry_count: u32,
        message: String,
    },

    /// The job failed past its analysis' retry threshold
    #[error("Job {job_id} failed permanently: {message}")]
    PermanentJobFailure { job_id: i64, message: String },

    /// The worker holding a job disappeared
    #[error("Worker {worker_id} lost: {cause}")]
    WorkerLost { worker_id: i64, cause: String },

    /// The job store could not serve the request
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    /// A funnel semaphore was decremented below zero. Always a bug.
    #[error("Semaphore underflow on funnel job {funnel_job_id} (released by job {job_id})")]
    SemaphoreUnderflow { funnel_job_id: i64, job_id: i64 },

    /// Job not found in the store
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    /// Analysis not found in the pipeline or store
    #[error("Analysis not found: {0}")]
    AnalysisNotFound(String),

    /// Worker not found in the store
    #[error("Worker not found: {0}")]
    WorkerNotFound(i64),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Parameter lookup or substitution error
    #[error("Param error: {0}")]
    Param(String),

    /// Execution backend error
    #[error("Meadow error: {0}")]
    Meadow(String),

    /// Configuration or pipeline definition error
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<rusqlite::Error> for ApiaryError {
    fn from(err: rusqlite::Error) -> Self {
        ApiaryError::StoreUnavailable(err.to_string())
    }
}

impl ApiaryError {
    /// Whether the current scheduling pass has to be abandoned.
    pub fn aborts_pass(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::SemaphoreUnderflow { .. })
    }
}

/// Result type alias for Apiary operations
pub type Result<T> = std::result::Result<T, ApiaryError>;
