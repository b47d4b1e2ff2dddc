//! # Timer Slots
//!
//! One cancellable timer per concern (handshake timeout, reconnect backoff,
//! keep-alive, pairing window).
//!
//! ```text
//!   slot.schedule(2s, fire_a)      slot.schedule(4s, fire_b)
//!        │                               │
//!        ▼                               ▼
//!   ┌─────────┐   aborted before    ┌─────────┐
//!   │ task A  │ ─────────────────►  │ task B  │ ──► fire_b after 4s
//!   └─────────┘   B is spawned      └─────────┘
//! ```
//!
//! Scheduling always replaces; a slot never holds two live timers.
//! Dropping the slot cancels its timer.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// A single-owner, overwritable timer.
#[derive(Debug)]
pub struct TimerSlot {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    /// Runs `fut` after `delay`, cancelling whatever this slot held before.
    pub fn schedule<F>(&mut self, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        trace!(timer = self.name, ?delay, "Timer armed");
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        }));
    }

    /// Cancels the pending timer. Returns whether one was live.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let live = !handle.is_finished();
                handle.abort();
                if live {
                    trace!(timer = self.name, "Timer cancelled");
                }
                live
            }
            None => false,
        }
    }

    /// Whether a timer is scheduled and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
