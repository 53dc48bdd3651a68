//! # Polled Queue
//!
//! Reliable-delivery adapter between an in-process task framework and a
//! remote, HTTP long-polled message queue.
//!
//! The remote only offers coarse primitives (push, long-poll reserve,
//! release, delete, batch delete, clear). This library turns them into:
//! - Asynchronous enqueue through a local buffered add pipeline
//! - Advisory duplicate suppression for named messages
//! - Low-latency deletion coalesced into bounded batches
//! - Reservation with repair of a queue the remote reports missing
//! - Bounded retries for transient (server-side) failures
//!
//! ## Module Organization
//!
//! - [`error`] - Error types and remote error classification
//! - [`message`] - The message model
//! - [`envelope`] - Transport envelope and body codec
//! - [`retry`] - Bounded retry executor and backoff
//! - [`dedup`] - Duplicate suppression store and key derivation
//! - [`remote`] - Remote queue trait, HTTP client and in-memory backend
//! - [`pipeline`] - Add and delete pipelines
//! - [`queue`] - The [`TaskQueue`] trait and [`PolledQueue`] adapter
//! - [`consumer`] - Handler-driving consumer loop

pub mod config;
pub mod consumer;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod remote;
pub mod retry;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root for convenience
pub use config::QueueOptions;
pub use consumer::{Consumer, ConsumerConfig, ConsumerStatsSnapshot};
pub use dedup::{dedup_key, DedupStore, InMemoryDedupStore};
pub use envelope::{decode_message, encode_message, Envelope};
pub use error::{
    CodecError, ConfigurationError, NotFoundReason, QueueError, RemoteError, ValidationError,
};
pub use handler::{handler_fn, HandlerError, MessageHandler};
pub use message::{Message, MessageError};
pub use pipeline::{PipelineConfig, PipelineStatsSnapshot};
pub use queue::{PolledQueue, PolledQueueBuilder, QueueStats, TaskQueue};
pub use remote::{HttpRemoteConfig, HttpRemoteQueue, InMemoryRemote, RemoteQueue};
pub use retry::{Backoff, RetryPolicy};
