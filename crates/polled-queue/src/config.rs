//! Adapter configuration.

use crate::consumer::ConsumerConfig;
use crate::error::ValidationError;
use crate::pipeline::delete::BatchConfig;
use crate::pipeline::PipelineConfig;
use crate::remote::MAX_DELETE_BATCH;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Options for one [`PolledQueue`](crate::queue::PolledQueue)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Visibility timeout applied to each reservation
    pub reservation_timeout_seconds: u64,

    /// Retry bound for release, delete and batch delete calls
    pub retry: RetryPolicy,

    pub add: PipelineConfig,

    pub delete: PipelineConfig,

    pub batch: BatchConfig,

    pub consumer: ConsumerConfig,

    /// How long dedup keys are remembered by the default store
    pub dedup_ttl_seconds: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            reservation_timeout_seconds: 300,
            retry: RetryPolicy::default(),
            add: PipelineConfig::default(),
            delete: PipelineConfig::default(),
            batch: BatchConfig::default(),
            consumer: ConsumerConfig::default(),
            dedup_ttl_seconds: 24 * 60 * 60,
        }
    }
}

impl QueueOptions {
    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_seconds)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_seconds)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch.max_batch_size < 2 || self.batch.max_batch_size > MAX_DELETE_BATCH {
            return Err(ValidationError::OutOfRange {
                field: "batch.max_batch_size".to_string(),
                message: format!("must be between 2 and {}", MAX_DELETE_BATCH),
            });
        }

        for (field, pipeline) in [("add", &self.add), ("delete", &self.delete)] {
            if pipeline.buffer_size == 0 {
                return Err(ValidationError::OutOfRange {
                    field: format!("{}.buffer_size", field),
                    message: "must be greater than zero".to_string(),
                });
            }
            if pipeline.retry_limit == 0 {
                return Err(ValidationError::OutOfRange {
                    field: format!("{}.retry_limit", field),
                    message: "must be greater than zero".to_string(),
                });
            }
            if pipeline.min_backoff_ms > pipeline.max_backoff_ms {
                return Err(ValidationError::OutOfRange {
                    field: format!("{}.min_backoff_ms", field),
                    message: "must not exceed max_backoff_ms".to_string(),
                });
            }
        }

        if self.add.concurrency == 0 {
            return Err(ValidationError::OutOfRange {
                field: "add.concurrency".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ValidationError::OutOfRange {
                field: "retry.max_attempts".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        self.consumer.validate()
    }
}
