//! Asynchronous push path.
//!
//! Accepted messages are buffered locally and pushed by a dispatch loop that
//! runs up to `concurrency` pushes at once. Each push is retried with
//! exponential backoff; a message that exhausts its attempts is logged,
//! counted, and handed to the fallback handler when one is configured.

use super::{Intake, PipelineConfig, PipelineStats, PipelineStatsSnapshot};
use crate::envelope::{encode_message, Envelope};
use crate::error::QueueError;
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::remote::RemoteQueue;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "add_tests.rs"]
mod tests;

/// Internal handler name recorded on envelopes entering the add pipeline
pub fn add_handler_name(queue: &str) -> String {
    format!("{}:add-message", queue)
}

struct AddWorker {
    remote: Arc<dyn RemoteQueue>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

/// Buffered push pipeline
pub struct AddPipeline {
    handler_name: String,
    intake: Intake<Envelope>,
    stats: Arc<PipelineStats>,
}

impl AddPipeline {
    /// Start the pipeline for `remote`. Must be called inside a Tokio runtime.
    pub fn start(
        remote: Arc<dyn RemoteQueue>,
        config: PipelineConfig,
        fallback: Option<Arc<dyn MessageHandler>>,
    ) -> Self {
        let handler_name = add_handler_name(remote.name());
        let stats = Arc::new(PipelineStats::default());
        let buffer_size = config.buffer_size;

        let worker = Arc::new(AddWorker {
            remote,
            config,
            stats: Arc::clone(&stats),
            fallback,
        });

        let intake = Intake::spawn(handler_name.clone(), buffer_size, Arc::clone(&stats), |rx| {
            worker.run(rx)
        });

        Self {
            handler_name,
            intake,
            stats,
        }
    }

    /// Accept a message for pushing; returns once it is buffered locally
    pub async fn submit(&self, message: Message) -> Result<(), QueueError> {
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

    /// Stop intake and wait for buffered and in-flight pushes to finish
    pub async fn close_timeout(&self, timeout: Duration) -> Result<(), QueueError> {
        self.intake.close_timeout(timeout).await
    }
}

impl AddWorker {
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>) -> Result<(), QueueError> {
        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut jobs = JoinSet::new();

        while let Some(envelope) = rx.recv().await {
            self.stats.record_dequeued();

            let permit = Arc::clone(&limit)
                .acquire_owned()
                .await
                .map_err(|e| QueueError::Worker {
                    pipeline: envelope.handler().to_string(),
                    message: e.to_string(),
                })?;

            while let Some(finished) = jobs.try_join_next() {
                if let Err(join_error) = finished {
                    error!(error = %join_error, "Push job panicked");
                }
            }

            let worker = Arc::clone(&self);
            jobs.spawn(async move {
                let _permit = permit;
                worker.deliver_guarded(envelope).await;
            });
        }

        while let Some(finished) = jobs.join_next().await {
            if let Err(join_error) = finished {
                error!(error = %join_error, "Push job panicked");
            }
        }

        Ok(())
    }

    /// Deliver, treating a panic inside the push as a permanent failure
    async fn deliver_guarded(&self, envelope: Envelope) {
        let handler = envelope.handler().to_string();
        let message = envelope.message().clone();

        if let Err(panic) = AssertUnwindSafe(self.deliver(envelope)).catch_unwind().await {
            error!(
                pipeline = %handler,
                task = %message.task_name,
                panic = %panic_reason(&*panic),
                "Push job panicked"
            );
            self.stats.record_fail();
            self.fall_back(&handler, &message).await;
        }
    }

    async fn deliver(&self, envelope: Envelope) {
        let handler = envelope.handler().to_string();
        let mut message = envelope.into_message();

        let body = match encode_message(&message) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    pipeline = %handler,
                    task = %message.task_name,
                    error = %e,
                    "Failed to encode message for push"
                );
                self.stats.record_fail();
                self.fall_back(&handler, &message).await;
                return;
            }
        };

        let attempts = self.config.retry_limit.max(1);
        let backoff = self.config.backoff();
        let mut attempt = 1;

        loop {
            match self.remote.push(body.clone(), message.delay_seconds()).await {
                Ok(id) => {
                    debug!(
                        pipeline = %handler,
                        task = %message.task_name,
                        message_id = %id,
                        "Message pushed"
                    );
                    message.id = Some(id);
                    self.stats.record_processed(1);
                    return;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        pipeline = %handler,
                        task = %message.task_name,
                        attempt = attempt,
                        error = %e,
                        "Push failed, retrying"
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        pipeline = %handler,
                        task = %message.task_name,
                        attempts = attempt,
                        error = %e,
                        "Push failed permanently"
                    );
                    self.stats.record_fail();
                    self.fall_back(&handler, &message).await;
                    return;
                }
            }
        }
    }

    async fn fall_back(&self, handler: &str, message: &Message) {
        let Some(fallback) = self.fallback.as_ref() else {
            return;
        };

        match fallback.handle(message).await {
            Ok(()) => debug!(pipeline = %handler, task = %message.task_name, "Fallback handled message"),
            Err(e) => error!(
                pipeline = %handler,
                task = %message.task_name,
                error = %e,
                "Fallback handler failed"
            ),
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
