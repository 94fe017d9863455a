//! Per-workflow message mailbox.
//!
//! The accumulate step races a timeout against message arrival here,
//! and the Brain's `has_pending_messages()` peeks non-destructively.
//! The pending flag is monotonic within a turn: once a message has
//! arrived mid-turn the answer stays `true` until the workflow begins a
//! fresh logical turn.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use acf_domain::RawMessage;

/// In-process mailbox connecting the adapter to a running workflow.
#[derive(Default)]
pub struct TurnMailbox {
    queue: Mutex<VecDeque<RawMessage>>,
    notify: Notify,
    /// Sticky "a message arrived during this turn" flag.
    pending: AtomicBool,
}

impl TurnMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a `new_message` event to the workflow.
    pub fn post(&self, message: RawMessage) {
        self.queue.lock().push_back(message);
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Non-destructive peek: did any message arrive during this turn?
    /// Monotonic within a turn.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) || !self.queue.lock().is_empty()
    }

    /// Pop the oldest undelivered message, if any.
    pub fn try_take(&self) -> Option<RawMessage> {
        self.queue.lock().pop_front()
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<RawMessage> {
        self.queue.lock().drain(..).collect()
    }

    /// Reset the sticky pending flag at a fresh logical turn boundary.
    /// Stays set while undelivered messages remain.
    pub fn begin_turn(&self) {
        let has_queued = !self.queue.lock().is_empty();
        self.pending.store(has_queued, Ordering::Release);
    }

    /// Wait up to `timeout` for a message.  Returns `None` on timeout.
    pub async fn wait_for_message(&self, timeout: Duration) -> Option<RawMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_take() {
                return Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return self.try_take(),
            }
        }
    }
}
