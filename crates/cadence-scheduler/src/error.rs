use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schedule definition is malformed (bad cron, interval, instant or timezone).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The payload is missing required fields (e.g. empty message text).
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The operation needs an enabled job.
    #[error("Job is disabled: {id}")]
    JobDisabled { id: String },

    /// Another run of the same job is already in flight.
    #[error("Run skipped, job {id} is already running")]
    RunSkipped { id: String },

    /// The action runtime reported a failure or timed out.
    #[error("Run failed: {0}")]
    RunFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::InvalidPayload(_) => "INVALID_PAYLOAD",
            SchedulerError::JobNotFound { .. } => "NOT_FOUND",
            SchedulerError::JobDisabled { .. } => "JOB_DISABLED",
            SchedulerError::RunSkipped { .. } => "RUN_SKIPPED",
            SchedulerError::RunFailed(_) => "RUN_FAILED",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True for errors caused by caller input rather than the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidSchedule(_) | SchedulerError::InvalidPayload(_)
        )
    }

    pub(crate) fn not_found(id: &str) -> Self {
        SchedulerError::JobNotFound { id: id.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
