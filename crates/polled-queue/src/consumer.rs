//! Consumer loop that drives a [`MessageHandler`] from a [`TaskQueue`].
//!
//! The fetch loop reserves messages and runs each on a bounded set of handler
//! tasks. Outcomes per message:
//! - handler success: the message is queued for batched deletion
//! - handler failure or undecodable body: released with exponential backoff
//! - failure on its last allowed reservation: counted as failed and deleted
//! - reserved more than `retry_limit` times: treated as poison and deleted
//!   without running the handler

use crate::error::{QueueError, ValidationError};
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::queue::TaskQueue;
use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

// ============================================================================
// Configuration
// ============================================================================

/// Consumer tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum handlers running at once
    pub concurrency: usize,

    /// Upper bound on messages requested per reservation
    pub reservation_size: usize,

    /// Long-poll wait per reservation
    pub wait_timeout_seconds: u64,

    /// Reservations allowed before a message is given up on
    pub retry_limit: u32,

    pub min_backoff_ms: u64,

    pub max_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            reservation_size: 10,
            wait_timeout_seconds: 10,
            retry_limit: 64,
            min_backoff_ms: 1000,
            max_backoff_ms: 3_600_000,
        }
    }
}

impl ConsumerConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.min_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency == 0 {
            return Err(ValidationError::OutOfRange {
                field: "consumer.concurrency".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.reservation_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "consumer.reservation_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(ValidationError::OutOfRange {
                field: "consumer.min_backoff_ms".to_string(),
                message: "must not exceed max_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct ConsumerStats {
    processed: AtomicU64,
    retries: AtomicU64,
    fails: AtomicU64,
    poisoned: AtomicU64,
}

/// Point-in-time consumer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStatsSnapshot {
    pub processed: u64,
    pub retries: u64,
    pub fails: u64,
    pub poisoned: u64,
}

impl ConsumerStats {
    fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct ConsumerWorker {
    queue: Arc<dyn TaskQueue>,
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<ConsumerStats>,
}

/// Running consumer; stop it with [`Consumer::stop_timeout`]
pub struct Consumer {
    queue_name: String,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    /// Spawn the fetch loop. Must be called inside a Tokio runtime.
    pub fn start(
        queue: Arc<dyn TaskQueue>,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let queue_name = queue.name().to_string();
        let stats = Arc::new(ConsumerStats::default());
        let (stop, stop_rx) = watch::channel(false);

        let worker = Arc::new(ConsumerWorker {
            queue,
            config,
            handler,
            stats: Arc::clone(&stats),
        });

        info!(queue = %queue_name, "Consumer started");
        let handle = tokio::spawn(worker.run(stop_rx));

        Self {
            queue_name,
            stop,
            worker: Mutex::new(Some(handle)),
            stats,
        }
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the loop to stop and wait up to `timeout` for in-flight handlers
    pub async fn stop_timeout(&self, timeout: Duration) -> Result<(), QueueError> {
        let _ = self.stop.send(true);

        let Some(mut handle) = self.lock_worker().take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!(queue = %self.queue_name, "Consumer stopped");
                Ok(())
            }
            Ok(Err(join_error)) => Err(QueueError::Worker {
                pipeline: format!("{}:consumer", self.queue_name),
                message: join_error.to_string(),
            }),
            Err(_) => {
                *self.lock_worker() = Some(handle);
                Err(QueueError::StopTimeout {
                    queue: self.queue_name.clone(),
                    timeout,
                })
            }
        }
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConsumerWorker {
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut jobs = JoinSet::new();
        let queue_name = self.queue.name().to_string();

        loop {
            if *stop.borrow() {
                break;
            }

            // Reserve only what can start right away so reservations do not
            // expire while waiting for a free handler slot.
            let ready = tokio::select! {
                _ = stop.changed() => break,
                permit = Arc::clone(&limit).acquire_owned() => permit.is_ok(),
            };
            if !ready {
                break;
            }
            let n = self
                .config
                .reservation_size
                .min(limit.available_permits())
                .max(1);

            let reserved = tokio::select! {
                _ = stop.changed() => break,
                result = self.queue.reserve_n(n, self.config.wait_timeout()) => result,
            };

            let messages = match reserved {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(queue = %queue_name, error = %e, "Reservation failed");
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(self.config.backoff().min) => {}
                    }
                    continue;
                }
            };

            for message in messages {
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let worker = Arc::clone(&self);
                jobs.spawn(async move {
                    let _permit = permit;
                    worker.process(message).await;
                });
            }

            while let Some(finished) = jobs.try_join_next() {
                if let Err(join_error) = finished {
                    error!(queue = %queue_name, error = %join_error, "Handler task panicked");
                }
            }
        }

        debug!(queue = %queue_name, in_flight = jobs.len(), "Consumer waiting for handlers");
        while let Some(finished) = jobs.join_next().await {
            if let Err(join_error) = finished {
                error!(queue = %queue_name, error = %join_error, "Handler task panicked");
            }
        }
    }

    async fn process(&self, message: Message) {
        let message_id = message.id.clone().unwrap_or_default();

        if message.reserved_count > self.config.retry_limit {
            warn!(
                message_id = %message_id,
                reserved_count = message.reserved_count,
                "Poison message, deleting without processing"
            );
            self.stats.poisoned.fetch_add(1, Ordering::Relaxed);
            self.discard(&message).await;
            return;
        }

        let outcome = match message.err {
            Some(ref err) => Err(err.to_string()),
            None => self
                .handler
                .handle(&message)
                .await
                .map_err(|e| e.to_string()),
        };

        match outcome {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.queue.delete_batched(&message).await {
                    error!(message_id = %message_id, error = %e, "Failed to queue delete");
                }
            }
            Err(reason) if message.reserved_count >= self.config.retry_limit => {
                error!(
                    message_id = %message_id,
                    task = %message.task_name,
                    reserved_count = message.reserved_count,
                    error = %reason,
                    "Message failed on its final attempt"
                );
                self.stats.fails.fetch_add(1, Ordering::Relaxed);
                self.discard(&message).await;
            }
            Err(reason) => {
                let delay = self.config.backoff().delay(message.reserved_count);
                warn!(
                    message_id = %message_id,
                    task = %message.task_name,
                    reserved_count = message.reserved_count,
                    delay_secs = delay.as_secs(),
                    error = %reason,
                    "Message failed, releasing"
                );
                self.stats.retries.fetch_add(1, Ordering::Relaxed);

                let released = message.with_delay(delay);
                if let Err(e) = self.queue.release(&released).await {
                    error!(message_id = %message_id, error = %e, "Failed to release message");
                }
            }
        }
    }

    async fn discard(&self, message: &Message) {
        if let Err(e) = self.queue.delete_batched(message).await {
            error!(
                message_id = message.id.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to queue delete"
            );
        }
    }
}
