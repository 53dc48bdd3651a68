//! Common test utilities for polled-queue integration tests
//!
//! This module provides:
//! - A remote wrapper that counts calls and fails on demand
//! - A collecting message handler
//! - Option presets with short timings

use async_trait::async_trait;
use polled_queue::remote::{QueueInfo, RemoteMessage, ReservedRef};
use polled_queue::{
    HandlerError, InMemoryRemote, Message, MessageHandler, QueueOptions, RemoteError, RemoteQueue,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Flaky Remote
// ============================================================================

/// In-memory remote that answers 503 for the next N calls of an operation
#[allow(dead_code)]
pub struct FlakyRemote {
    inner: InMemoryRemote,
    calls: Mutex<HashMap<&'static str, u32>>,
    outages: Mutex<HashMap<&'static str, u32>>,
}

#[allow(dead_code)]
impl FlakyRemote {
    pub fn new(inner: InMemoryRemote) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(HashMap::new()),
            outages: Mutex::new(HashMap::new()),
        })
    }

    /// Fail the next `count` calls to `operation` with a server error
    pub fn outage(&self, operation: &'static str, count: u32) {
        self.outages.lock().unwrap().insert(operation, count);
    }

    pub fn calls(&self, operation: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, operation: &'static str) -> Result<(), RemoteError> {
        *self.calls.lock().unwrap().entry(operation).or_insert(0) += 1;
        let mut outages = self.outages.lock().unwrap();
        match outages.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RemoteError::Status {
                    status: 503,
                    message: "service unavailable".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteQueue for FlakyRemote {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn push(&self, body: String, delay_secs: u64) -> Result<String, RemoteError> {
        self.enter("push")?;
        self.inner.push(body, delay_secs).await
    }

    async fn long_poll(
        &self,
        n: usize,
        reservation_secs: u64,
        wait_secs: u64,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.enter("long_poll")?;
        self.inner.long_poll(n, reservation_secs, wait_secs).await
    }

    async fn release(
        &self,
        id: &str,
        reservation_id: &str,
        delay_secs: u64,
    ) -> Result<(), RemoteError> {
        self.enter("release")?;
        self.inner.release(id, reservation_id, delay_secs).await
    }

    async fn delete(&self, id: &str, reservation_id: &str) -> Result<(), RemoteError> {
        self.enter("delete")?;
        self.inner.delete(id, reservation_id).await
    }

    async fn delete_reserved(&self, messages: &[ReservedRef]) -> Result<(), RemoteError> {
        self.enter("delete_reserved")?;
        self.inner.delete_reserved(messages).await
    }

    async fn clear(&self) -> Result<(), RemoteError> {
        self.enter("clear")?;
        self.inner.clear().await
    }

    async fn info(&self) -> Result<QueueInfo, RemoteError> {
        self.enter("info")?;
        self.inner.info().await
    }

    async fn create_queue(&self) -> Result<(), RemoteError> {
        self.enter("create_queue")?;
        self.inner.create_queue().await
    }
}

// ============================================================================
// Collecting Handler
// ============================================================================

/// Handler that records payloads and rejects any payload listed in `reject`
#[derive(Default)]
#[allow(dead_code)]
pub struct CollectingHandler {
    payloads: Mutex<Vec<String>>,
    reject: Vec<String>,
}

#[allow(dead_code)]
impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting(payloads: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            payloads: Mutex::new(Vec::new()),
            reject: payloads.iter().map(|p| p.to_string()).collect(),
        })
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let payload = String::from_utf8_lossy(&message.payload).into_owned();
        self.payloads.lock().unwrap().push(payload.clone());
        if self.reject.contains(&payload) {
            return Err(format!("rejected {}", payload).into());
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Options with millisecond backoffs and a short batch linger
#[allow(dead_code)]
pub fn fast_options() -> QueueOptions {
    let mut options = QueueOptions::default();
    options.add.min_backoff_ms = 1;
    options.add.max_backoff_ms = 5;
    options.delete.min_backoff_ms = 1;
    options.delete.max_backoff_ms = 5;
    options.batch.batch_linger_ms = 20;
    options.consumer.wait_timeout_seconds = 1;
    options.consumer.min_backoff_ms = 1;
    options.consumer.max_backoff_ms = 5;
    options
}

/// Poll `condition` every 10ms until it holds, panicking after `limit`
#[allow(dead_code)]
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
