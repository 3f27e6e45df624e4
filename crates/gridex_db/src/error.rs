//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("username '{0}' is already taken")]
    UsernameTaken(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job {0} is not pending")]
    NotPending(String),

    #[error("job {0} is not running")]
    NotRunning(String),

    #[error("user {user_id} does not own job {job_id}")]
    NotOwner { user_id: String, job_id: String },

    #[error("invalid stored payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("artifact i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}
