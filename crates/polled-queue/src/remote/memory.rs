//! In-memory remote queue for testing and development.
//!
//! This module provides a fully functional in-process stand-in for the remote
//! service that:
//! - Honours push delays and reservation (visibility) timeouts
//! - Counts reservations per message for poison detection
//! - Blocks long-polls until a message becomes available or the wait elapses
//! - Can simulate a queue that was deleted and must be re-provisioned

use super::{QueueInfo, RemoteMessage, RemoteQueue, ReservedRef};
use crate::error::{NotFoundReason, RemoteError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Reservation timeout applied when the caller passes zero
const DEFAULT_RESERVATION_SECS: u64 = 60;

/// Stand-in for "never" when a deadline would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `now + secs`, saturating to a far-future instant instead of overflowing
fn after_secs(now: Instant, secs: u64) -> Instant {
    now.checked_add(Duration::from_secs(secs))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct QueueState {
    exists: bool,
    /// Messages in push order
    messages: Vec<StoredMessage>,
}

struct StoredMessage {
    id: String,
    body: String,
    available_at: Instant,
    reservation: Option<Reservation>,
    reserved_count: u32,
}

struct Reservation {
    id: String,
    expires_at: Instant,
}

impl StoredMessage {
    fn is_available(&self, now: Instant) -> bool {
        let unreserved = match self.reservation {
            Some(ref reservation) => now >= reservation.expires_at,
            None => true,
        };
        unreserved && now >= self.available_at
    }

    /// Earliest instant at which this message could become reservable
    fn next_available(&self) -> Instant {
        match self.reservation {
            Some(ref reservation) => reservation.expires_at.max(self.available_at),
            None => self.available_at,
        }
    }

    /// An expired reservation no longer settles the message
    fn holds(&self, reservation_id: &str, now: Instant) -> bool {
        self.reservation
            .as_ref()
            .is_some_and(|r| r.id == reservation_id && now < r.expires_at)
    }
}

fn queue_not_found() -> RemoteError {
    RemoteError::NotFound {
        reason: NotFoundReason::QueueNotFound,
        message: "Queue not found".to_string(),
    }
}

fn message_not_found() -> RemoteError {
    RemoteError::NotFound {
        reason: NotFoundReason::MessageNotFound,
        message: "Message not found".to_string(),
    }
}

// ============================================================================
// InMemoryRemote
// ============================================================================

/// In-memory remote queue implementation
#[derive(Clone)]
pub struct InMemoryRemote {
    name: String,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryRemote {
    /// Create a new, existing, empty queue
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_existence(name.into(), true)
    }

    /// Create a handle to a queue that does not exist until `create_queue`
    pub fn missing(name: impl Into<String>) -> Self {
        Self::with_existence(name.into(), false)
    }

    fn with_existence(name: String, exists: bool) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(QueueState {
                exists,
                messages: Vec::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Simulate the queue being deleted out from under the adapter
    pub fn delete_queue(&self) {
        let mut state = self.lock();
        state.exists = false;
        state.messages.clear();
    }

    /// Number of messages currently reserved
    pub fn reserved_len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .messages
            .iter()
            .filter(|m| m.reservation.is_some() && !m.is_available(now))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn existing(&self) -> Result<MutexGuard<'_, QueueState>, RemoteError> {
        let state = self.lock();
        if !state.exists {
            return Err(queue_not_found());
        }
        Ok(state)
    }

    /// Reserve what is available now; returns the records and the next wake-up hint
    fn try_reserve(
        &self,
        n: usize,
        reservation_secs: u64,
    ) -> Result<(Vec<RemoteMessage>, Option<Instant>), RemoteError> {
        let mut state = self.existing()?;
        let now = Instant::now();
        let secs = if reservation_secs == 0 {
            DEFAULT_RESERVATION_SECS
        } else {
            reservation_secs
        };
        let expires_at = after_secs(now, secs);

        let mut reserved = Vec::new();
        let mut next_wake: Option<Instant> = None;

        for stored in state.messages.iter_mut() {
            if reserved.len() >= n {
                break;
            }
            if !stored.is_available(now) {
                let candidate = stored.next_available();
                next_wake = Some(next_wake.map_or(candidate, |w| w.min(candidate)));
                continue;
            }

            let reservation_id = uuid::Uuid::new_v4().to_string();
            stored.reservation = Some(Reservation {
                id: reservation_id.clone(),
                expires_at,
            });
            stored.reserved_count += 1;

            reserved.push(RemoteMessage {
                id: stored.id.clone(),
                reservation_id,
                body: stored.body.clone(),
                reserved_count: stored.reserved_count,
            });
        }

        Ok((reserved, next_wake))
    }
}

#[async_trait]
impl RemoteQueue for InMemoryRemote {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, body: String, delay_secs: u64) -> Result<String, RemoteError> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.existing()?;
            state.messages.push(StoredMessage {
                id: id.clone(),
                body,
                available_at: after_secs(Instant::now(), delay_secs),
                reservation: None,
                reserved_count: 0,
            });
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn long_poll(
        &self,
        n: usize,
        reservation_secs: u64,
        wait_secs: u64,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        let deadline = after_secs(Instant::now(), wait_secs);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (reserved, next_wake) = self.try_reserve(n, reservation_secs)?;
            if !reserved.is_empty() || n == 0 {
                return Ok(reserved);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake = next_wake.map_or(deadline, |w| w.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn release(
        &self,
        id: &str,
        reservation_id: &str,
        delay_secs: u64,
    ) -> Result<(), RemoteError> {
        {
            let mut state = self.existing()?;
            let now = Instant::now();
            let stored = state
                .messages
                .iter_mut()
                .find(|m| m.id == id && m.holds(reservation_id, now))
                .ok_or_else(message_not_found)?;
            stored.reservation = None;
            stored.available_at = after_secs(now, delay_secs);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self, id: &str, reservation_id: &str) -> Result<(), RemoteError> {
        let mut state = self.existing()?;
        let now = Instant::now();
        let index = state
            .messages
            .iter()
            .position(|m| m.id == id && m.holds(reservation_id, now))
            .ok_or_else(message_not_found)?;
        state.messages.remove(index);
        Ok(())
    }

    async fn delete_reserved(&self, messages: &[ReservedRef]) -> Result<(), RemoteError> {
        let mut state = self.existing()?;
        let now = Instant::now();
        let before = state.messages.len();
        state.messages.retain(|stored| {
            !messages
                .iter()
                .any(|r| r.id == stored.id && stored.holds(&r.reservation_id, now))
        });

        if before - state.messages.len() < messages.len() {
            return Err(message_not_found());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), RemoteError> {
        self.existing()?.messages.clear();
        Ok(())
    }

    async fn info(&self) -> Result<QueueInfo, RemoteError> {
        let state = self.existing()?;
        Ok(QueueInfo {
            name: self.name.clone(),
            size: state.messages.len(),
        })
    }

    async fn create_queue(&self) -> Result<(), RemoteError> {
        self.lock().exists = true;
        Ok(())
    }
}
