//! Asynchronous event notification for snapshot consumers.
//!
//! Grounded on `examples/original_source/module/event_queue.c`: a bounded
//! log of events plus a wakeup, re-expressed with [`tokio::sync::Notify`]
//! instead of a kernel wait queue.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

/// Events a snapshot or its diff area can raise for a waiting consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Diff storage is below its low-space watermark.
    LowSpace,
    /// Diff storage has been fully allocated.
    Filled,
    /// A write could not be serviced and the diff area is now corrupted.
    Overflow,
    /// The diff area has latched a fatal error.
    Corrupted(String),
    /// The snapshot image's original device went away.
    Terminated,
    /// An allocation failed because there was truly nowhere to grow.
    NoSpace,
}

#[derive(Error, Debug)]
pub enum EventError {
    /// `wait` was asked to return before an event arrived and a deadline
    /// (or an external cancellation) fired first.
    #[error("wait interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, EventError>;

/// FIFO queue of events plus a notification for waiters. Bounded so a
/// wedged consumer can't grow this without limit; the oldest event is
/// dropped to make room, matching the kernel module's ring-buffer log.
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an event and wake any waiter.
    pub fn push(&self, event: Event) {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_waiters();
    }

    /// Pop the oldest pending event without waiting.
    pub fn try_pop(&self) -> Option<Event> {
        self.inner.lock().pop_front()
    }

    /// Wait up to `timeout` for an event, returning it immediately if one
    /// is already queued. [`EventError::Interrupted`] on timeout, matching
    /// the control plane's `wait_event` contract (`spec.md` §4.5, §6).
    pub async fn wait(&self, timeout: Duration) -> Result<Event> {
        if let Some(event) = self.try_pop() {
            return Ok(event);
        }

        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => {
                self.try_pop().ok_or(EventError::Interrupted)
            }
            _ = tokio::time::sleep(timeout) => Err(EventError::Interrupted),
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
