//! Error types for queue operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all adapter operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Message task name is required")]
    TaskNameRequired,

    #[error("Message must carry an id and reservation id to be {operation}")]
    ReservationRequired { operation: String },

    #[error("Remote queue error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Batch flush requested with no messages in pipeline '{pipeline}'")]
    EmptyBatch { pipeline: String },

    #[error("Pipeline '{pipeline}' is closed")]
    Closed { pipeline: String },

    #[error("Pipeline '{pipeline}' did not drain within {timeout:?}")]
    DrainTimeout { pipeline: String, timeout: Duration },

    #[error("Consumer for '{queue}' did not stop within {timeout:?}")]
    StopTimeout { queue: String, timeout: Duration },

    #[error("A consumer is already running for '{queue}'")]
    ConsumerRunning { queue: String },

    #[error("Worker task for '{pipeline}' failed: {message}")]
    Worker { pipeline: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote(remote) => remote.is_server_error(),
            Self::DrainTimeout { .. } => true,
            Self::StopTimeout { .. } => true,
            Self::TaskNameRequired
            | Self::ReservationRequired { .. }
            | Self::Codec(_)
            | Self::EmptyBatch { .. }
            | Self::Closed { .. }
            | Self::ConsumerRunning { .. }
            | Self::Worker { .. }
            | Self::Configuration(_)
            | Self::Validation(_) => false,
        }
    }

    /// Check if the underlying remote reported the message or queue as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::NotFound { .. }))
    }
}

/// Why the remote answered "not found".
///
/// The remote reports an empty long-poll and a deleted queue with the same
/// status code; callers branch on this reason instead of on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// No message matched (empty poll, or message already deleted)
    MessageNotFound,
    /// The queue itself does not exist
    QueueNotFound,
    /// Any other not-found answer
    Other,
}

impl NotFoundReason {
    /// Classify a not-found response body.
    ///
    /// Compatibility shim for services that only describe the reason in the
    /// message text. Prefer a typed code when the service returns one.
    pub fn from_message(message: &str) -> Self {
        if message.contains("Message not found") {
            Self::MessageNotFound
        } else if message.contains("Queue not found") {
            Self::QueueNotFound
        } else {
            Self::Other
        }
    }
}

/// Errors reported by the remote queue service
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Not found ({reason:?}): {message}")]
    NotFound {
        reason: NotFoundReason,
        message: String,
    },

    #[error("Remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Invalid response from remote: {message}")]
    InvalidResponse { message: String },
}

impl RemoteError {
    /// Build an error from an HTTP status and the service's message text
    pub fn from_status(status: u16, message: String) -> Self {
        if status == 404 {
            Self::NotFound {
                reason: NotFoundReason::from_message(&message),
                message,
            }
        } else {
            Self::Status { status, message }
        }
    }

    /// HTTP status equivalent of this error, if it carries one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound { .. } => Some(404),
            Self::Status { status, .. } => Some(*status),
            Self::Transport { .. } | Self::InvalidResponse { .. } => None,
        }
    }

    /// Check if this is a server-side fault (5xx or equivalent) worth retrying
    pub fn is_server_error(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500,
            Self::Transport { .. } => true,
            Self::NotFound { .. } | Self::InvalidResponse { .. } => false,
        }
    }

    /// Check if the remote reported an empty long-poll
    pub fn is_empty_poll(&self) -> bool {
        matches!(
            self,
            Self::NotFound {
                reason: NotFoundReason::MessageNotFound,
                ..
            }
        )
    }

    /// Check if the remote reported that the queue does not exist
    pub fn is_queue_missing(&self) -> bool {
        matches!(
            self,
            Self::NotFound {
                reason: NotFoundReason::QueueNotFound,
                ..
            }
        )
    }
}

/// Errors during transport encoding/decoding of message bodies
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport string is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
