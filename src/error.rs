//! Error types for scrape-batch operations.
//!
//! Defines the error types for each subsystem:
//! - Task store persistence (in-memory and SQLite)
//! - Page extraction through the external extractor
//! - Job scheduling commands (start, pause, resume, cancel, retry)
//! - Configuration validation

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job '{0}' not found")]
    JobNotFound(Uuid),

    #[error("Task '{0}' not found")]
    TaskNotFound(Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Errors reported by a page extractor.
///
/// The scheduler never inspects these beyond their message: every variant is
/// retried until the job's retry budget is spent.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to spawn extractor: {0}")]
    Spawn(String),

    #[error("Extractor exited with code {code}: {stderr}")]
    Process { code: i32, stderr: String },

    #[error("Extraction timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse extractor output: {0}")]
    Parse(String),

    #[error("Extraction failed: {0}")]
    Failed(String),
}

/// Errors returned synchronously by scheduling commands.
///
/// None of these mutate state: a rejected command leaves the job and its
/// tasks exactly as they were.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job '{0}' not found")]
    JobNotFound(Uuid),

    #[error("Task '{task_id}' does not belong to job '{job_id}'")]
    TaskNotFound { job_id: Uuid, task_id: Uuid },

    #[error("Job '{0}' already has an active runner")]
    AlreadyRunning(Uuid),

    #[error("Job '{job_id}' is being run elsewhere (lease held by runner '{owner}')")]
    LeaseHeld { job_id: Uuid, owner: Uuid },

    #[error("Cannot {operation} job '{job_id}' while it is {status}")]
    InvalidState {
        job_id: Uuid,
        status: String,
        operation: &'static str,
    },

    #[error("Cannot retry task '{task_id}' while it is {status}")]
    InvalidTaskState { task_id: Uuid, status: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur while validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for StoreError {
    fn from(err: ConfigError) -> Self {
        StoreError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_error_display() {
        let id = Uuid::new_v4();
        let err = SchedulerError::AlreadyRunning(id);
        assert!(err.to_string().contains("already has an active runner"));

        let owner = Uuid::new_v4();
        let err = SchedulerError::LeaseHeld { job_id: id, owner };
        assert!(err.to_string().contains(&owner.to_string()));

        let err = SchedulerError::InvalidState {
            job_id: id,
            status: "completed".to_string(),
            operation: "resume",
        };
        assert!(err.to_string().contains("Cannot resume"));
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_store_error_converts_into_scheduler_error() {
        let id = Uuid::new_v4();
        let err: SchedulerError = StoreError::JobNotFound(id).into();
        assert!(matches!(err, SchedulerError::Store(StoreError::JobNotFound(x)) if x == id));
    }

    #[test]
    fn test_config_error_becomes_validation() {
        let err = ConfigError::InvalidValue {
            field: "max_concurrency",
            reason: "must be at least 1".to_string(),
        };
        let store_err: StoreError = err.into();
        assert!(matches!(store_err, StoreError::Validation(msg) if msg.contains("max_concurrency")));
    }
}
