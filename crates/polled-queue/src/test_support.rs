//! Shared test doubles for unit tests.

use crate::error::RemoteError;
use crate::handler::{HandlerError, MessageHandler};
use crate::message::Message;
use crate::remote::{InMemoryRemote, QueueInfo, RemoteMessage, RemoteQueue, ReservedRef};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Remote wrapper that counts calls, records batch sizes and injects failures
pub(crate) struct RecordingRemote {
    inner: InMemoryRemote,
    calls: Mutex<HashMap<&'static str, u32>>,
    failures: Mutex<HashMap<&'static str, VecDeque<RemoteError>>>,
    batch_sizes: Mutex<Vec<usize>>,
    push_delays: Mutex<Vec<u64>>,
    poll_sizes: Mutex<Vec<usize>>,
    poll_waits: Mutex<Vec<u64>>,
    panics: Mutex<Vec<&'static str>>,
    delete_latency: Mutex<Duration>,
}

impl RecordingRemote {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Self::wrap(InMemoryRemote::new(name))
    }

    pub(crate) fn wrap(inner: InMemoryRemote) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            batch_sizes: Mutex::new(Vec::new()),
            push_delays: Mutex::new(Vec::new()),
            poll_sizes: Mutex::new(Vec::new()),
            poll_waits: Mutex::new(Vec::new()),
            panics: Mutex::new(Vec::new()),
            delete_latency: Mutex::new(Duration::ZERO),
        })
    }

    pub(crate) fn inner(&self) -> &InMemoryRemote {
        &self.inner
    }

    /// Make the next call to `operation` fail with `error`
    pub(crate) fn fail_next(&self, operation: &'static str, error: RemoteError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Make the next call to `operation` panic
    pub(crate) fn panic_next(&self, operation: &'static str) {
        self.panics.lock().unwrap().push(operation);
    }

    pub(crate) fn calls(&self, operation: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub(crate) fn push_delays(&self) -> Vec<u64> {
        self.push_delays.lock().unwrap().clone()
    }

    pub(crate) fn poll_sizes(&self) -> Vec<usize> {
        self.poll_sizes.lock().unwrap().clone()
    }

    pub(crate) fn poll_waits(&self) -> Vec<u64> {
        self.poll_waits.lock().unwrap().clone()
    }

    pub(crate) fn set_delete_latency(&self, latency: Duration) {
        *self.delete_latency.lock().unwrap() = latency;
    }

    /// Push `count` messages and reserve them all
    pub(crate) async fn reserved(&self, count: usize) -> Vec<Message> {
        for i in 0..count {
            self.inner.push(format!("body-{}", i), 0).await.unwrap();
        }
        self.inner
            .long_poll(count, 60, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|record| {
                let mut message = Message::new("task", record.body.into_bytes());
                message.id = Some(record.id);
                message.reservation_id = Some(record.reservation_id);
                message.reserved_count = record.reserved_count;
                message
            })
            .collect()
    }

    fn record(&self, operation: &'static str) -> Result<(), RemoteError> {
        *self.calls.lock().unwrap().entry(operation).or_insert(0) += 1;
        let should_panic = {
            let mut panics = self.panics.lock().unwrap();
            match panics.iter().position(|op| *op == operation) {
                Some(index) => {
                    panics.remove(index);
                    true
                }
                None => false,
            }
        };
        if should_panic {
            panic!("injected {} panic", operation);
        }
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

pub(crate) fn server_error() -> RemoteError {
    RemoteError::Status {
        status: 503,
        message: "service unavailable".to_string(),
    }
}

#[async_trait]
impl RemoteQueue for RecordingRemote {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn push(&self, body: String, delay_secs: u64) -> Result<String, RemoteError> {
        self.record("push")?;
        self.push_delays.lock().unwrap().push(delay_secs);
        self.inner.push(body, delay_secs).await
    }

    async fn long_poll(
        &self,
        n: usize,
        reservation_secs: u64,
        wait_secs: u64,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.record("long_poll")?;
        self.poll_sizes.lock().unwrap().push(n);
        self.poll_waits.lock().unwrap().push(wait_secs);
        self.inner.long_poll(n, reservation_secs, wait_secs).await
    }

    async fn release(
        &self,
        id: &str,
        reservation_id: &str,
        delay_secs: u64,
    ) -> Result<(), RemoteError> {
        self.record("release")?;
        self.inner.release(id, reservation_id, delay_secs).await
    }

    async fn delete(&self, id: &str, reservation_id: &str) -> Result<(), RemoteError> {
        self.record("delete")?;
        self.inner.delete(id, reservation_id).await
    }

    async fn delete_reserved(&self, messages: &[ReservedRef]) -> Result<(), RemoteError> {
        let latency = *self.delete_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.record("delete_reserved")?;
        self.batch_sizes.lock().unwrap().push(messages.len());
        self.inner.delete_reserved(messages).await
    }

    async fn clear(&self) -> Result<(), RemoteError> {
        self.record("clear")?;
        self.inner.clear().await
    }

    async fn info(&self) -> Result<QueueInfo, RemoteError> {
        self.record("info")?;
        self.inner.info().await
    }

    async fn create_queue(&self) -> Result<(), RemoteError> {
        self.record("create_queue")?;
        self.inner.create_queue().await
    }
}

/// Handler that records every message and fails while `failures` remain
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub(crate) seen: Mutex<Vec<Message>>,
    pub(crate) failures: Mutex<u32>,
}

impl RecordingHandler {
    pub(crate) fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            failures: Mutex::new(failures),
        })
    }

    pub(crate) fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(message.clone());
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err("handler failure".into());
        }
        Ok(())
    }
}
