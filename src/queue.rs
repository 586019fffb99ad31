//! Outbound queue for messages sent while disconnected
//!
//! Entries are replayed oldest-first on the next successful connection.
//! Entries older than the configured maximum age are dropped at flush.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Message waiting for a connection
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub enqueued_at: Instant,
    pub payload: String,
}

impl QueuedMessage {
    /// Time spent in the queue as of `now`
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// Result of one flush pass
#[derive(Debug, Default, PartialEq)]
pub struct Flush {
    /// Payloads to send, in enqueue order
    pub fresh: Vec<String>,
    /// Number of entries discarded for exceeding the maximum age
    pub expired: usize,
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: String, now: Instant) {
        self.entries.push_back(QueuedMessage {
            enqueued_at: now,
            payload,
        });
    }

    /// Empty the queue in one pass
    ///
    /// With `max_age` set, entries strictly older than it are dropped;
    /// `None` keeps everything.
    pub fn flush(&mut self, now: Instant, max_age: Option<Duration>) -> Flush {
        let mut flush = Flush::default();
        for entry in self.entries.drain(..) {
            match max_age {
                Some(max_age) if entry.age(now) > max_age => flush.expired += 1,
                _ => flush.fresh.push(entry.payload),
            }
        }
        flush
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
