//! The reactor's single blocking point.
//!
//! A [`Dispatcher`] parks the reactor thread until work arrives, the period
//! elapses, or the compartment is interrupted. Transports that poll their
//! own readiness (sockets, pipes) supply their own dispatcher so that I/O
//! and queued tasks wake the same thread.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use junction_core::{Result, TransportError};

pub trait Dispatcher: Send + Sync {
    /// Block for at most `period`. Returns early when woken. Fails with
    /// [`TransportError::Interrupted`] once [`interrupt`](Self::interrupt)
    /// has been called, and keeps failing from then on.
    fn block(&self, period: Duration) -> Result<()>;

    /// Cut the current (or next) `block` short.
    fn wakeup(&self);

    /// Permanently interrupt the reactor.
    fn interrupt(&self);

    fn is_interrupted(&self) -> bool;
}

#[derive(Debug, Default)]
struct Signals {
    woken: bool,
    interrupted: bool,
}

/// Condvar-backed dispatcher for compartments with no I/O of their own.
#[derive(Debug, Default)]
pub struct DefaultDispatcher {
    signals: Mutex<Signals>,
    cond: Condvar,
}

impl DefaultDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatcher for DefaultDispatcher {
    fn block(&self, period: Duration) -> Result<()> {
        let guard = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut signals, _timeout) = self
            .cond
            .wait_timeout_while(guard, period, |s| !s.woken && !s.interrupted)
            .unwrap_or_else(PoisonError::into_inner);
        signals.woken = false;
        if signals.interrupted {
            return Err(TransportError::Interrupted);
        }
        Ok(())
    }

    fn wakeup(&self) {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        signals.woken = true;
        self.cond.notify_one();
    }

    fn interrupt(&self) {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        signals.interrupted = true;
        self.cond.notify_all();
    }

    fn is_interrupted(&self) -> bool {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .interrupted
    }
}
