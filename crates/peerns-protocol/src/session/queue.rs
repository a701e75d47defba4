//! Per-contact send queue.
//!
//! Frames wait here until the session's hello handshake verifies, then
//! drain in order. A failure counter drives the linear reconnect backoff;
//! once it passes the retry budget the queue is flushed as failed and the
//! contact falls back to rendezvous.

use std::collections::VecDeque;
use std::time::Duration;

use crate::types::{MAX_CONNECT_RETRIES, SEND_RETRY_BASE_MS};
use crate::wire::Frame;

/// A frame waiting for delivery. `msg_id` ties message frames back to the
/// chat log for status updates.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub frame: Frame,
    pub msg_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct Outbox {
    items: VecDeque<QueuedFrame>,
    failures: u32,
    retry_base: Duration,
    max_retries: u32,
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            failures: 0,
            retry_base: Duration::from_millis(SEND_RETRY_BASE_MS),
            max_retries: MAX_CONNECT_RETRIES,
        }
    }

    pub fn with_retry(retry_base: Duration, max_retries: u32) -> Self {
        Self {
            items: VecDeque::new(),
            failures: 0,
            retry_base,
            max_retries,
        }
    }

    pub fn push(&mut self, frame: Frame, msg_id: Option<String>) {
        self.items.push_back(QueuedFrame { frame, msg_id });
    }

    /// Take everything, in order.
    pub fn drain(&mut self) -> Vec<QueuedFrame> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Record a connection failure. Returns the delay before the next
    /// attempt, or `None` once the retry budget is spent.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures > self.max_retries {
            None
        } else {
            Some(self.retry_base * self.failures)
        }
    }

    /// Reset the counter after a successful connection.
    pub fn reset_failures(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Message ids of queued message frames, for flagging as failed.
    pub fn message_ids(&self) -> Vec<String> {
        self.items.iter().filter_map(|q| q.msg_id.clone()).collect()
    }
}
