//! The adapter: a [`TaskQueue`] over a long-polled remote queue.
//!
//! [`PolledQueue`] wires together:
//! - the dedup filter, consulted before a named message is accepted
//! - the add pipeline, which pushes accepted messages asynchronously
//! - the reservation path, which long-polls and decodes records
//! - the delete pipeline, which settles completed messages in batches
//! - an optional [`Consumer`] driving a [`MessageHandler`]
//!
//! # Example
//!
//! ```no_run
//! use polled_queue::{InMemoryRemote, Message, PolledQueue, QueueOptions, TaskQueue};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), polled_queue::QueueError> {
//! let remote = Arc::new(InMemoryRemote::new("emails"));
//! let queue = PolledQueue::builder(remote, QueueOptions::default()).build()?;
//!
//! let mut message = Message::new("send-welcome", &b"user-42"[..]).with_name("welcome-42");
//! queue.add(&mut message).await?;
//!
//! for reserved in queue.reserve_n(10, Duration::from_secs(1)).await? {
//!     queue.delete_batched(&reserved).await?;
//! }
//!
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::QueueOptions;
use crate::consumer::{Consumer, ConsumerStatsSnapshot};
use crate::dedup::{dedup_key, DedupStore, InMemoryDedupStore};
use crate::envelope::decode_message;
use crate::error::{QueueError, RemoteError};
use crate::handler::MessageHandler;
use crate::message::{Message, MessageError};
use crate::pipeline::{AddPipeline, DeletePipeline, PipelineStatsSnapshot};
use crate::remote::{RemoteMessage, RemoteQueue, MAX_RESERVE_COUNT, MAX_WAIT_SECONDS};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;

/// Deadline used by [`TaskQueue::close`]
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// TaskQueue Trait
// ============================================================================

/// Queue capability the task framework programs against
#[async_trait]
pub trait TaskQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Number of messages the remote currently holds
    async fn len(&self) -> Result<usize, QueueError>;

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Accept a message for asynchronous delivery
    ///
    /// Returns once the message is buffered locally. A message whose name was
    /// already seen is not submitted; `message.err` is set to
    /// [`MessageError::Duplicate`] and `Ok(())` is returned.
    async fn add(&self, message: &mut Message) -> Result<(), QueueError>;

    /// Reserve up to `n` messages, waiting up to `wait_timeout` for work
    async fn reserve_n(&self, n: usize, wait_timeout: Duration)
        -> Result<Vec<Message>, QueueError>;

    /// Return a reserved message to the queue after `message.delay`
    async fn release(&self, message: &Message) -> Result<(), QueueError>;

    /// Delete a reserved message immediately; an already-gone message is success
    async fn delete(&self, message: &Message) -> Result<(), QueueError>;

    /// Queue a reserved message for deletion in the next batch
    async fn delete_batched(&self, message: &Message) -> Result<(), QueueError>;

    /// Remove every message from the remote queue
    async fn purge(&self) -> Result<(), QueueError>;

    fn stats(&self) -> QueueStats;

    /// Close with [`DEFAULT_CLOSE_TIMEOUT`]
    async fn close(&self) -> Result<(), QueueError> {
        self.close_timeout(DEFAULT_CLOSE_TIMEOUT).await
    }

    /// Stop the consumer and drain both pipelines, each step bounded by `timeout`
    ///
    /// The first error encountered is returned; later ones are logged.
    async fn close_timeout(&self, timeout: Duration) -> Result<(), QueueError>;
}

/// Snapshot of adapter activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub add: PipelineStatsSnapshot,
    pub delete: PipelineStatsSnapshot,
    pub consumer: Option<ConsumerStatsSnapshot>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`PolledQueue`]
pub struct PolledQueueBuilder {
    remote: Arc<dyn RemoteQueue>,
    options: QueueOptions,
    dedup: Option<Arc<dyn DedupStore>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl PolledQueueBuilder {
    /// Replace the default in-memory dedup store
    pub fn dedup_store(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(store);
        self
    }

    /// Handler that processes messages locally when pushing fails for good
    pub fn fallback_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Validate options and start both pipelines. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<PolledQueue, QueueError> {
        self.options.validate()?;

        let dedup = self
            .dedup
            .unwrap_or_else(|| Arc::new(InMemoryDedupStore::new(self.options.dedup_ttl())));

        let add_pipeline = AddPipeline::start(
            Arc::clone(&self.remote),
            self.options.add.clone(),
            self.fallback,
        );
        let delete_pipeline = DeletePipeline::start(
            Arc::clone(&self.remote),
            self.options.delete.clone(),
            self.options.batch.clone(),
            self.options.retry.clone(),
        );

        info!(queue = %self.remote.name(), "Queue adapter started");

        Ok(PolledQueue {
            remote: self.remote,
            options: self.options,
            dedup,
            add_pipeline,
            delete_pipeline,
            consumer: Mutex::new(None),
        })
    }
}

// ============================================================================
// PolledQueue
// ============================================================================

/// Reliable-delivery adapter over a [`RemoteQueue`]
pub struct PolledQueue {
    remote: Arc<dyn RemoteQueue>,
    options: QueueOptions,
    dedup: Arc<dyn DedupStore>,
    add_pipeline: AddPipeline,
    delete_pipeline: DeletePipeline,
    consumer: Mutex<Option<Consumer>>,
}

impl PolledQueue {
    pub fn builder(remote: Arc<dyn RemoteQueue>, options: QueueOptions) -> PolledQueueBuilder {
        PolledQueueBuilder {
            remote,
            options,
            dedup: None,
            fallback: None,
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Attach a consumer that feeds reserved messages to `handler`
    ///
    /// The consumer holds a reference to the queue until it is stopped by
    /// [`TaskQueue::close_timeout`].
    pub fn start_consumer(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        let mut slot = self.consumer_slot();
        if slot.is_some() {
            return Err(QueueError::ConsumerRunning {
                queue: self.name().to_string(),
            });
        }

        let queue: Arc<dyn TaskQueue> = Arc::clone(self) as Arc<dyn TaskQueue>;
        *slot = Some(Consumer::start(queue, self.options.consumer.clone(), handler));
        Ok(())
    }

    fn consumer_slot(&self) -> MutexGuard<'_, Option<Consumer>> {
        self.consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn is_duplicate(&self, message: &Message) -> bool {
        let Some(name) = message.name.as_deref().filter(|n| !n.is_empty()) else {
            return false;
        };

        let key = dedup_key(self.name(), &message.task_name, name);
        self.dedup.exists(&key).await
    }

    fn reservation<'m>(
        message: &'m Message,
        operation: &str,
    ) -> Result<(&'m str, &'m str), QueueError> {
        message
            .reservation()
            .ok_or_else(|| QueueError::ReservationRequired {
                operation: operation.to_string(),
            })
    }

    /// Build a message from a reserved record; decode failures stay on the record
    fn from_record(&self, record: RemoteMessage) -> Message {
        let mut message = match decode_message(&record.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    queue = %self.name(),
                    message_id = %record.id,
                    error = %e,
                    "Failed to decode reserved message"
                );
                let mut undecodable = Message::new(String::new(), Bytes::new());
                undecodable.err = Some(MessageError::Decode(e.to_string()));
                undecodable
            }
        };

        message.id = Some(record.id);
        message.reservation_id = Some(record.reservation_id);
        message.reserved_count = record.reserved_count;
        message
    }

    /// Best-effort re-provisioning after the remote reported the queue missing
    async fn repair_missing_queue(&self, cause: &RemoteError) {
        warn!(queue = %self.name(), error = %cause, "Remote queue missing, recreating");
        match self.remote.create_queue().await {
            Ok(()) => info!(queue = %self.name(), "Remote queue recreated"),
            Err(e) => error!(queue = %self.name(), error = %e, "Failed to recreate remote queue"),
        }
    }
}

#[async_trait]
impl TaskQueue for PolledQueue {
    fn name(&self) -> &str {
        self.remote.name()
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.remote.info().await?.size)
    }

    async fn add(&self, message: &mut Message) -> Result<(), QueueError> {
        if message.task_name.is_empty() {
            return Err(QueueError::TaskNameRequired);
        }

        if self.is_duplicate(message).await {
            debug!(
                queue = %self.name(),
                task = %message.task_name,
                name = message.name.as_deref().unwrap_or_default(),
                "Duplicate message suppressed"
            );
            message.err = Some(MessageError::Duplicate);
            return Ok(());
        }

        self.add_pipeline.submit(message.clone()).await
    }

    async fn reserve_n(
        &self,
        n: usize,
        wait_timeout: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let n = n.min(MAX_RESERVE_COUNT);

        let records = match self
            .remote
            .long_poll(
                n,
                self.options.reservation_timeout().as_secs(),
                wait_timeout.as_secs().min(MAX_WAIT_SECONDS),
            )
            .await
        {
            Ok(records) => records,
            Err(e) if e.is_empty_poll() => return Ok(Vec::new()),
            Err(e) if e.is_queue_missing() => {
                self.repair_missing_queue(&e).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        debug!(queue = %self.name(), count = records.len(), "Reserved messages");
        Ok(records
            .into_iter()
            .map(|record| self.from_record(record))
            .collect())
    }

    async fn release(&self, message: &Message) -> Result<(), QueueError> {
        let (id, reservation_id) = Self::reservation(message, "released")?;
        let delay_secs = message.delay_seconds();

        self.options
            .retry
            .run(|| self.remote.release(id, reservation_id, delay_secs))
            .await?;
        Ok(())
    }

    async fn delete(&self, message: &Message) -> Result<(), QueueError> {
        let (id, reservation_id) = Self::reservation(message, "deleted")?;

        match self
            .options
            .retry
            .run(|| self.remote.delete(id, reservation_id))
            .await
        {
            Ok(()) => Ok(()),
            Err(RemoteError::NotFound { .. }) => {
                debug!(queue = %self.name(), message_id = %id, "Message already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_batched(&self, message: &Message) -> Result<(), QueueError> {
        self.delete_pipeline.submit(message.clone()).await
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.remote.clear().await?;
        info!(queue = %self.name(), "Queue purged");
        Ok(())
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            add: self.add_pipeline.stats(),
            delete: self.delete_pipeline.stats(),
            consumer: self.consumer_slot().as_ref().map(Consumer::stats),
        }
    }

    async fn close_timeout(&self, timeout: Duration) -> Result<(), QueueError> {
        let mut first_error: Option<QueueError> = None;
        let mut record = |result: Result<(), QueueError>, step: &str| {
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!(queue = %self.name(), step = step, error = %e, "Additional close error");
                }
            }
        };

        let consumer = self.consumer_slot().take();
        if let Some(consumer) = consumer {
            record(consumer.stop_timeout(timeout).await, "stop consumer");
        }

        record(self.add_pipeline.close_timeout(timeout).await, "drain add pipeline");
        record(
            self.delete_pipeline.close_timeout(timeout).await,
            "drain delete pipeline",
        );

        match first_error {
            Some(e) => {
                error!(queue = %self.name(), error = %e, "Queue adapter closed with error");
                Err(e)
            }
            None => {
                info!(queue = %self.name(), "Queue adapter closed");
                Ok(())
            }
        }
    }
}
