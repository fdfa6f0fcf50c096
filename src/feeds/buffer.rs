//! Bounded replay buffer for one feed.

use crate::types::Message;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    message: Arc<Message>,
    published: Instant,
}

/// Time-ordered buffer of the most recently published messages.
///
/// Appending never evicts on its own; callers evict explicitly with
/// [`FeedBuffer::evict_overflow`] once the message has been fanned out.
#[derive(Debug)]
pub struct FeedBuffer {
    entries: VecDeque<Entry>,
    max_count: usize,
}

impl FeedBuffer {
    pub fn new(max_count: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_count,
        }
    }

    /// Append a message at the newest end.
    pub fn push(&mut self, message: Arc<Message>) {
        self.entries.push_back(Entry {
            message,
            published: Instant::now(),
        });
    }

    /// Drop the oldest entries until the buffer is within its bound.
    /// Returns the number of entries dropped.
    pub fn evict_overflow(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.max_count {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Drop entries published more than `max_age` before `now`.
    pub fn expire(&mut self, max_age: Duration, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.published) <= max_age {
                break;
            }
            self.entries.pop_front();
            expired += 1;
        }
        expired
    }

    /// The newest `n` messages, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<Arc<Message>> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries
            .iter()
            .skip(skip)
            .map(|entry| Arc::clone(&entry.message))
            .collect()
    }

    /// Every buffered message, oldest first.
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.last_n(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }
}
