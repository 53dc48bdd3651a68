//! Batch accumulation policy for the delete pipeline.
//!
//! Items are appended to the open batch while it holds fewer than
//! `max_size - 1` members. Any further item flushes the open batch first and
//! starts a new one, so no batch ever reaches the hard ceiling.

use tokio::time::Instant;

#[cfg(test)]
#[path = "batcher_tests.rs"]
mod tests;

/// Single open batch with a size ceiling
#[derive(Debug)]
pub struct Batcher<T> {
    items: Vec<T>,
    max_size: usize,
    opened_at: Option<Instant>,
}

impl<T> Batcher<T> {
    /// Create a batcher; `max_size` below 2 is raised to 2
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(2);
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
            opened_at: None,
        }
    }

    /// Whether one more item may join a batch currently holding `len` items
    pub fn should_append(&self, len: usize) -> bool {
        len + 1 < self.max_size
    }

    /// Add an item, returning the batch that had to be flushed to make room
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        let flushed = if self.should_append(self.items.len()) {
            None
        } else {
            Some(self.take())
        };

        if self.items.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.items.push(item);
        flushed
    }

    /// Close the open batch and hand its members out
    pub fn take(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size))
    }

    /// When the open batch received its first member
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
