use thiserror::Error;
use super::types::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    Server {
        status_code: u16,
        message: String,
    },

    #[error("Upload aborted")]
    Aborted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Cannot {action} task {id} in state {status:?}")]
    InvalidTransition {
        id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Scheduler shut down")]
    SchedulerShutdown,
}

impl QueueError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Transport-level failures that end an attempt as `failed`.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Http(_) | Self::Server { .. })
    }
}

impl From<toml::de::Error> for QueueError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Error alias
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
