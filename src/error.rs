use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DroverError {
    #[error("Invalid task spec: {0}")]
    InvalidTaskSpec(String),

    #[error("Invalid requirement clause: {0:?}")]
    InvalidRequirement(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Remote command `{command}` failed with exit code {exit_code:?}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
    },

    #[error("Jobs can only be recovered before the scheduler starts")]
    RecoveryAfterStart,

    #[error("Could not acquire worker target: {0}")]
    Acquire(String),

    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DroverError>;
