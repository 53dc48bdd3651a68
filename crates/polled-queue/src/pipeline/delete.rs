//! Batched delete path.
//!
//! Delete submissions are buffered locally and consumed by a single batching
//! loop, so only one flush is ever in flight. The loop flushes when:
//! - the [`Batcher`] policy refuses another member
//! - the open batch has lingered for `batch_linger_ms`
//! - the intake is closed (final flush during drain)
//!
//! A failed flush reschedules its members with backoff until each has used
//! `retry_limit` attempts. Not-found failures are not rescheduled since the
//! reservation they reference can no longer be settled.

use super::{Batcher, Intake, PipelineConfig, PipelineStats, PipelineStatsSnapshot};
use crate::envelope::Envelope;
use crate::error::QueueError;
use crate::message::Message;
use crate::remote::{RemoteQueue, ReservedRef, MAX_DELETE_BATCH};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "delete_tests.rs"]
mod tests;

/// Parked deadline for timers that are disabled in the select loop
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Internal handler name recorded on envelopes entering the delete pipeline
pub fn delete_handler_name(queue: &str) -> String {
    format!("{}:delete-message", queue)
}

/// Batch shaping for the delete pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Hard ceiling for one batch delete call
    pub max_batch_size: usize,

    /// How long a partially filled batch may wait before it is flushed
    pub batch_linger_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_DELETE_BATCH,
            batch_linger_ms: 3000,
        }
    }
}

impl BatchConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.batch_linger_ms)
    }
}

/// Issue one batch delete, retrying server errors per `retry`
///
/// An empty batch is a caller bug and is reported as [`QueueError::EmptyBatch`].
pub async fn flush_batch(
    remote: &dyn RemoteQueue,
    retry: &RetryPolicy,
    batch: &[ReservedRef],
) -> Result<(), QueueError> {
    if batch.is_empty() {
        return Err(QueueError::EmptyBatch {
            pipeline: delete_handler_name(remote.name()),
        });
    }

    retry
        .run(|| remote.delete_reserved(batch))
        .await
        .map_err(QueueError::from)
}

#[derive(Debug)]
struct PendingDelete {
    reference: ReservedRef,
    attempts: u32,
}

struct DeleteWorker {
    name: String,
    remote: Arc<dyn RemoteQueue>,
    config: PipelineConfig,
    batch: BatchConfig,
    retry: RetryPolicy,
    stats: Arc<PipelineStats>,
}

/// Buffered, batching delete pipeline
pub struct DeletePipeline {
    handler_name: String,
    intake: Intake<Envelope>,
    stats: Arc<PipelineStats>,
}

impl DeletePipeline {
    /// Start the pipeline for `remote`. Must be called inside a Tokio runtime.
    pub fn start(
        remote: Arc<dyn RemoteQueue>,
        config: PipelineConfig,
        batch: BatchConfig,
        retry: RetryPolicy,
    ) -> Self {
        let handler_name = delete_handler_name(remote.name());
        let stats = Arc::new(PipelineStats::default());
        let buffer_size = config.buffer_size;

        let worker = DeleteWorker {
            name: handler_name.clone(),
            remote,
            config,
            batch,
            retry,
            stats: Arc::clone(&stats),
        };

        let intake = Intake::spawn(handler_name.clone(), buffer_size, Arc::clone(&stats), |rx| {
            worker.run(rx)
        });

        Self {
            handler_name,
            intake,
            stats,
        }
    }

    /// Queue a reserved message for deletion in a later batch
    pub async fn submit(&self, message: Message) -> Result<(), QueueError> {
        if message.reservation().is_none() {
            return Err(QueueError::ReservationRequired {
                operation: "deleted".to_string(),
            });
        }

        self.intake
            .submit(Envelope::wrap(message, self.handler_name.as_str()))
            .await
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.intake.is_closed()
    }

    /// Stop intake, flush everything buffered, and wait for scheduled retries
    pub async fn close_timeout(&self, timeout: Duration) -> Result<(), QueueError> {
        self.intake.close_timeout(timeout).await
    }
}

impl DeleteWorker {
    async fn run(self, mut rx: mpsc::Receiver<Envelope>) -> Result<(), QueueError> {
        let mut batcher: Batcher<PendingDelete> = Batcher::new(self.batch.max_batch_size);
        let mut scheduled: Vec<(Instant, PendingDelete)> = Vec::new();
        let mut intake_open = true;
        let mut first_error: Option<QueueError> = None;

        loop {
            if !intake_open {
                if !batcher.is_empty() {
                    let batch = batcher.take();
                    self.flush(batch, &mut scheduled, &mut first_error, true)
                        .await;
                }
                if scheduled.is_empty() {
                    break;
                }
            }

            let idle = Instant::now() + IDLE_WAKE;
            let linger_at = batcher.opened_at().map(|opened| opened + self.batch.linger());
            let retry_at = scheduled.iter().map(|(due, _)| *due).min();

            tokio::select! {
                received = rx.recv(), if intake_open => match received {
                    Some(envelope) => {
                        self.stats.record_dequeued();
                        if let Some(item) = self.pending(envelope) {
                            if let Some(full) = batcher.push(item) {
                                self.flush(full, &mut scheduled, &mut first_error, false).await;
                            }
                        }
                    }
                    None => {
                        debug!(pipeline = %self.name, "Intake closed, draining");
                        intake_open = false;
                    }
                },
                _ = sleep_until(linger_at.unwrap_or(idle)), if linger_at.is_some() => {
                    let batch = batcher.take();
                    self.flush(batch, &mut scheduled, &mut first_error, !intake_open).await;
                }
                _ = sleep_until(retry_at.unwrap_or(idle)), if retry_at.is_some() => {
                    let now = Instant::now();
                    let (due, later): (Vec<_>, Vec<_>) =
                        scheduled.drain(..).partition(|(at, _)| *at <= now);
                    scheduled = later;

                    for (_, item) in due {
                        if let Some(full) = batcher.push(item) {
                            self.flush(full, &mut scheduled, &mut first_error, !intake_open).await;
                        }
                    }
                }
            }
        }

        info!(pipeline = %self.name, "Delete pipeline drained");
        first_error.map_or(Ok(()), Err)
    }

    fn pending(&self, envelope: Envelope) -> Option<PendingDelete> {
        let message = envelope.into_message();
        match message.reservation() {
            Some((id, reservation_id)) => Some(PendingDelete {
                reference: ReservedRef::new(id, reservation_id),
                attempts: 0,
            }),
            None => {
                error!(
                    pipeline = %self.name,
                    task = %message.task_name,
                    "Dropping delete without reservation"
                );
                self.stats.record_fail();
                None
            }
        }
    }

    async fn flush(
        &self,
        batch: Vec<PendingDelete>,
        scheduled: &mut Vec<(Instant, PendingDelete)>,
        first_error: &mut Option<QueueError>,
        draining: bool,
    ) {
        let refs: Vec<ReservedRef> = batch.iter().map(|p| p.reference.clone()).collect();

        let err = match flush_batch(self.remote.as_ref(), &self.retry, &refs).await {
            Ok(()) => {
                debug!(pipeline = %self.name, batch_size = refs.len(), "Batch deleted");
                self.stats.record_processed(refs.len() as u64);
                return;
            }
            Err(err) => err,
        };

        error!(
            pipeline = %self.name,
            batch_size = refs.len(),
            error = %err,
            "Batch delete failed"
        );

        let reschedule = !err.is_not_found();
        let limit = self.config.retry_limit.max(1);
        let backoff = self.config.backoff();
        let mut abandoned = 0;

        for mut item in batch {
            item.attempts += 1;
            if reschedule && item.attempts < limit {
                self.stats.record_retry();
                scheduled.push((Instant::now() + backoff.delay(item.attempts), item));
            } else {
                warn!(
                    pipeline = %self.name,
                    message_id = %item.reference.id,
                    attempts = item.attempts,
                    "Giving up on delete"
                );
                self.stats.record_fail();
                abandoned += 1;
            }
        }

        if draining && abandoned > 0 && first_error.is_none() {
            *first_error = Some(err);
        }
    }
}
