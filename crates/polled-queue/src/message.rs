//! Message types flowing through the adapter.

use crate::remote::MAX_DELAY_SECONDS;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Message Errors
// ============================================================================

/// Terminal error attached to a message for inspection.
///
/// These are not returned from adapter calls; they travel with the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message is a duplicate and was not submitted")]
    Duplicate,

    #[error("failed to decode message body: {0}")]
    Decode(String),
}

// ============================================================================
// Message
// ============================================================================

/// The unit of work submitted to and reserved from the queue
///
/// Only `task_name`, `name` and `payload` travel in the transport body. The
/// remote assigns `id`, `reservation_id` and `reserved_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Remote-assigned identity; `None` until pushed
    #[serde(skip)]
    pub id: Option<String>,
    /// Logical name used for duplicate suppression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Handler that consumes this message
    pub task_name: String,
    #[serde(with = "bytes_serde")]
    pub payload: Bytes,
    /// Visibility delay before first reservation (or after release)
    #[serde(skip)]
    pub delay: Duration,
    #[serde(skip)]
    pub err: Option<MessageError>,
    /// Token proving the holder owns the current reservation
    #[serde(skip)]
    pub reservation_id: Option<String>,
    /// Number of times the remote has handed this message out
    #[serde(skip)]
    pub reserved_count: u32,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Create new message for a task with payload
    pub fn new(task_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            name: None,
            task_name: task_name.into(),
            payload: payload.into(),
            delay: Duration::ZERO,
            err: None,
            reservation_id: None,
            reserved_count: 0,
        }
    }

    /// Set logical name used for duplicate suppression
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set visibility delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Check if the message was suppressed as a duplicate
    pub fn is_duplicate(&self) -> bool {
        matches!(self.err, Some(MessageError::Duplicate))
    }

    /// Identity and reservation token, if this message is currently reserved
    pub fn reservation(&self) -> Option<(&str, &str)> {
        match (self.id.as_deref(), self.reservation_id.as_deref()) {
            (Some(id), Some(reservation_id)) if !id.is_empty() && !reservation_id.is_empty() => {
                Some((id, reservation_id))
            }
            _ => None,
        }
    }

    /// Delay rounded down to whole seconds and capped at the remote's limit
    pub fn delay_seconds(&self) -> u64 {
        self.delay.as_secs().min(MAX_DELAY_SECONDS)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
