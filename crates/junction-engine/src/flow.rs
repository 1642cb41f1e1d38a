//! Upstream flow control.
//!
//! The compartment locks flow when its queue grows past the high watermark
//! and unlocks it once the queue drains below the low watermark. Locking is
//! reentrant: several independent sources may hold the lock at once, and
//! the gate only sees the first lock and the last unlock.

use std::sync::{Mutex, PoisonError};

/// The hook that actually pauses and resumes producers, e.g. stops reading
/// from a socket.
pub trait FlowGate: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

pub trait FlowController: Send + Sync {
    fn lock_flow(&self);
    fn unlock_flow(&self);
    fn is_locked(&self) -> bool;
}

/// Call-counted controller around a [`FlowGate`].
///
/// Unmatched unlocks saturate at zero instead of underflowing.
pub struct ReentrantFlowController<G> {
    gate: G,
    // Held across gate calls so pause/resume are never reordered.
    count: Mutex<usize>,
}

impl<G: FlowGate> ReentrantFlowController<G> {
    pub fn new(gate: G) -> Self {
        Self {
            gate,
            count: Mutex::new(0),
        }
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }

    pub fn lock_count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<G: FlowGate> FlowController for ReentrantFlowController<G> {
    fn lock_flow(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        if *count == 1 {
            tracing::debug!("flow locked");
            self.gate.pause();
        }
    }

    fn unlock_flow(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        match *count {
            0 => tracing::debug!("unmatched flow unlock ignored"),
            1 => {
                *count = 0;
                tracing::debug!("flow unlocked");
                self.gate.resume();
            }
            _ => *count -= 1,
        }
    }

    fn is_locked(&self) -> bool {
        self.lock_count() > 0
    }
}

/// Gate that does nothing; the lock state is still observable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGate;

impl FlowGate for NoopGate {
    fn pause(&self) {}
    fn resume(&self) {}
}
