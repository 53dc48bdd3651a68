//! Remote queue collaborator.
//!
//! The remote offers coarse primitives only: push one message, long-poll
//! reserve up to N messages, release, delete one or many reserved messages,
//! clear, and provision. This module contains the trait every backend
//! implements along with the concrete implementations.

use crate::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod memory;

pub use http::{HttpRemoteConfig, HttpRemoteQueue};
pub use memory::InMemoryRemote;

/// Maximum messages a single long-poll may return
pub const MAX_RESERVE_COUNT: usize = 100;

/// Maximum messages a single batch delete may carry
pub const MAX_DELETE_BATCH: usize = 10;

/// Longest server-side wait a long-poll accepts
pub const MAX_WAIT_SECONDS: u64 = 30;

/// Longest push or release delay the remote accepts (seven days)
pub const MAX_DELAY_SECONDS: u64 = 7 * 24 * 60 * 60;

/// A record handed out by a long-poll reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    pub reservation_id: String,
    pub body: String,
    pub reserved_count: u32,
}

/// Identity of one reserved message, used for deletes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedRef {
    pub id: String,
    pub reservation_id: String,
}

impl ReservedRef {
    pub fn new(id: impl Into<String>, reservation_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reservation_id: reservation_id.into(),
        }
    }
}

/// Queue metadata reported by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub size: usize,
}

/// Interface implemented by remote queue backends
#[async_trait]
pub trait RemoteQueue: Send + Sync {
    /// Queue name on the remote
    fn name(&self) -> &str;

    /// Push one message body, visible after `delay_secs`
    async fn push(&self, body: String, delay_secs: u64) -> Result<String, RemoteError>;

    /// Reserve up to `n` messages, blocking server-side up to `wait_secs`
    async fn long_poll(
        &self,
        n: usize,
        reservation_secs: u64,
        wait_secs: u64,
    ) -> Result<Vec<RemoteMessage>, RemoteError>;

    /// Return a reserved message to the queue after `delay_secs`
    async fn release(
        &self,
        id: &str,
        reservation_id: &str,
        delay_secs: u64,
    ) -> Result<(), RemoteError>;

    /// Delete one reserved message
    async fn delete(&self, id: &str, reservation_id: &str) -> Result<(), RemoteError>;

    /// Delete many reserved messages in one call
    async fn delete_reserved(&self, messages: &[ReservedRef]) -> Result<(), RemoteError>;

    /// Remove every message from the queue
    async fn clear(&self) -> Result<(), RemoteError>;

    /// Fetch queue metadata
    async fn info(&self) -> Result<QueueInfo, RemoteError>;

    /// Create the queue; succeeds if it already exists
    async fn create_queue(&self) -> Result<(), RemoteError>;
}
