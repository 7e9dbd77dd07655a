//! One-shot rendezvous between a caller and the thread doing its work.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
enum Slot<T> {
    Pending,
    Ready(T),
    Taken,
    Cancelled,
}

/// A value produced once on one thread and consumed on another.
///
/// The first [`complete`](Handoff::complete) wins; completing a cancelled
/// handoff is a no-op, so a worker that was given up on cannot deliver a
/// stale result.
#[derive(Debug)]
pub struct Handoff<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    /// Deliver the value. Returns false if it was already delivered or cancelled.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Ready(value);
        self.ready.notify_all();
        true
    }

    /// Wait for the value and take it. `None` waits forever.
    pub fn take(&self, timeout: Option<Duration>) -> Option<T> {
        let mut slot = self.slot.lock();
        self.wait_while_pending(&mut slot, timeout);
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Some(value),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Stop waiting. Returns the value if it slipped in before the cancel.
    pub fn cancel(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        let previous = std::mem::replace(&mut *slot, Slot::Cancelled);
        self.ready.notify_all();
        match previous {
            Slot::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Cancelled)
    }

    fn wait_while_pending(
        &self,
        slot: &mut parking_lot::MutexGuard<'_, Slot<T>>,
        timeout: Option<Duration>,
    ) {
        let deadline = timeout.map(|t| Instant::now() + t);
        while matches!(**slot, Slot::Pending) {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(slot),
            }
        }
    }
}

impl<T: Clone> Handoff<T> {
    /// Wait for the value and return a copy, leaving it for other waiters.
    pub fn peek(&self, timeout: Option<Duration>) -> Option<T> {
        let mut slot = self.slot.lock();
        self.wait_while_pending(&mut slot, timeout);
        match &*slot {
            Slot::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }
}
