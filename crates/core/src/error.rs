//! Caller-visible error model of the task engine.

use thiserror::Error;

use crate::resource::ResourceClass;

/// Result type used by the task engine's public operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Error returned by submission, cancellation, lookup and the concurrency gate.
///
/// Handler failures are not represented here: they are opaque strings stored
/// on the task itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The caller supplied blank or malformed arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The durable store could not be reached; the caller may retry.
    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    /// A concurrency gate stayed saturated for the whole acquire timeout.
    #[error("{0} busy")]
    ResourceBusy(ResourceClass),

    /// No handler is registered for the task's type.
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    /// The task belongs to someone else or already reached another terminal state.
    #[error("task not cancelable")]
    NotCancelable,

    #[error("task not found")]
    NotFound,
}

impl TaskError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Whether the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::ResourceBusy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_message_names_the_class() {
        assert_eq!(
            TaskError::ResourceBusy(ResourceClass::Ocr).to_string(),
            "ocr busy"
        );
        assert_eq!(
            TaskError::ResourceBusy(ResourceClass::BulkExport).to_string(),
            "bulk export busy"
        );
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(TaskError::store_unavailable("down").is_retryable());
        assert!(TaskError::ResourceBusy(ResourceClass::EmailDownload).is_retryable());
        assert!(!TaskError::invalid_input("x").is_retryable());
        assert!(!TaskError::NotCancelable.is_retryable());
        assert!(!TaskError::NotFound.is_retryable());
    }
}
