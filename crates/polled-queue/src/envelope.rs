//! Transport envelope and body codec.
//!
//! Messages are routed through the internal pipelines inside an [`Envelope`]
//! that names the pipeline handler while keeping the wrapped message intact.
//! Bodies sent to the remote are JSON-encoded, then base64-encoded so the
//! remote only ever stores a printable string.

use crate::error::CodecError;
use crate::message::Message;
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Wrapper carrying a message through an internal pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    handler: String,
    message: Message,
}

impl Envelope {
    /// Wrap a message for delivery to an internal handler
    pub fn wrap(message: Message, handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message,
        }
    }

    /// Name of the internal handler this envelope is routed to
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Borrow the wrapped message
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Take the wrapped message back
    pub fn into_message(self) -> Message {
        self.message
    }
}

/// Encode a message into the remote's transport string
pub fn encode_message(message: &Message) -> Result<String, CodecError> {
    let bytes = serde_json::to_vec(message)?;
    Ok(STANDARD.encode(bytes))
}

/// Decode a transport string back into a message
///
/// Remote-assigned fields (`id`, `reservation_id`, `reserved_count`) are left
/// empty; the caller fills them from the remote record.
pub fn decode_message(body: &str) -> Result<Message, CodecError> {
    let bytes = STANDARD.decode(body)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
