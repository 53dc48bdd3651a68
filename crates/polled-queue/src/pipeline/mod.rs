//! Local buffered pipelines that decouple callers from remote round-trips.
//!
//! Each pipeline is a bounded mpsc buffer drained by one spawned worker loop:
//! - [`add`] pushes accepted messages to the remote
//! - [`delete`] coalesces delete submissions into batch deletes
//!
//! Closing a pipeline drops its intake, lets the worker drain what is already
//! buffered, and waits for the worker up to a deadline.

use crate::error::QueueError;
use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub mod add;
pub mod batcher;
pub mod delete;

pub use add::AddPipeline;
pub use batcher::Batcher;
pub use delete::DeletePipeline;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// ============================================================================
// Configuration
// ============================================================================

/// Pipeline tuning shared by the add and delete paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the local buffer; submissions wait when it is full
    pub buffer_size: usize,

    /// Attempts per item before it is given up on
    pub retry_limit: u32,

    pub min_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Maximum remote calls in flight (add pipeline only)
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            retry_limit: 3,
            min_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            concurrency: 10,
        }
    }
}

impl PipelineConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.min_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Live counters for one pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    retries: AtomicU64,
    fails: AtomicU64,
    buffered: AtomicUsize,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub processed: u64,
    pub retries: u64,
    pub fails: u64,
    pub buffered: usize,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_processed(&self, count: u64) {
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fail(&self) {
        self.fails.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeued(&self) {
        self.buffered.fetch_sub(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Intake
// ============================================================================

type Worker = JoinHandle<Result<(), QueueError>>;

/// Sending half of a pipeline plus the handle of the loop draining it
pub(crate) struct Intake<T> {
    name: String,
    sender: Mutex<Option<mpsc::Sender<T>>>,
    worker: Mutex<Option<Worker>>,
    stats: Arc<PipelineStats>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Send + 'static> Intake<T> {
    /// Create the buffer and spawn `run` on it. Must be called inside a runtime.
    pub(crate) fn spawn<F, Fut>(
        name: String,
        buffer_size: usize,
        stats: Arc<PipelineStats>,
        run: F,
    ) -> Self
    where
        F: FnOnce(mpsc::Receiver<T>) -> Fut,
        Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let worker = tokio::spawn(run(receiver));
        debug!(pipeline = %name, buffer_size = buffer_size, "Pipeline started");

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            stats,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Accept an item into the buffer, waiting for space if it is full
    pub(crate) async fn submit(&self, item: T) -> Result<(), QueueError> {
        let sender = lock(&self.sender).clone().ok_or_else(|| self.closed())?;

        // Count before sending so the worker never observes a negative backlog
        self.stats.buffered.fetch_add(1, Ordering::Relaxed);
        if sender.send(item).await.is_err() {
            self.stats.buffered.fetch_sub(1, Ordering::Relaxed);
            return Err(self.closed());
        }
        Ok(())
    }

    /// Stop accepting items and wait up to `timeout` for the worker to finish
    ///
    /// On timeout the worker keeps running and a later call may wait again.
    pub(crate) async fn close_timeout(&self, timeout: Duration) -> Result<(), QueueError> {
        lock(&self.sender).take();

        let Some(mut worker) = lock(&self.worker).take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut worker).await {
            Ok(Ok(result)) => {
                debug!(pipeline = %self.name, "Pipeline drained");
                result
            }
            Ok(Err(join_error)) => Err(QueueError::Worker {
                pipeline: self.name.clone(),
                message: join_error.to_string(),
            }),
            Err(_) => {
                warn!(
                    pipeline = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    buffered = self.stats.buffered.load(Ordering::Relaxed),
                    "Pipeline did not drain before deadline"
                );
                *lock(&self.worker) = Some(worker);
                Err(QueueError::DrainTimeout {
                    pipeline: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    fn closed(&self) -> QueueError {
        QueueError::Closed {
            pipeline: self.name.clone(),
        }
    }
}
