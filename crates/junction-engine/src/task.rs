//! Units of work and their outcome callbacks.
//!
//! A [`Task`] runs on the reactor thread with mutable access to the
//! compartment's state. A [`LongTask`] runs on the worker pool without
//! that access; its outcome is carried back through the queue so the
//! callbacks still run on the reactor thread.
//!
//! Every task is executed at most once and its outcome is delivered exactly
//! once. Panics in a task body are caught and delivered as failures.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use junction_core::{Result, SizeHint, TransportError};

use crate::compartment::CompartmentHandle;

/// Type-erased queue entry body.
pub type Job<S> = Box<dyn FnOnce(&mut S, &CompartmentHandle<S>) -> Outcome + Send>;

type ShortBody<S, T> = Box<dyn FnOnce(&mut S, &CompartmentHandle<S>) -> Result<T> + Send>;
type LongBody<T> = Box<dyn FnOnce() -> Result<T> + Send>;
type SuccessFn<S, T> = Box<dyn FnOnce(&mut S, &CompartmentHandle<S>, T) + Send>;
type FailureFn<S> = Box<dyn FnOnce(&mut S, &CompartmentHandle<S>, TransportError) + Send>;

/// What happened to one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// The body raised the interruption signal. The reactor stops.
    Interrupted,
}

struct Callbacks<S, T> {
    on_success: Option<SuccessFn<S, T>>,
    on_failure: Option<FailureFn<S>>,
}

impl<S, T> Callbacks<S, T> {
    fn new() -> Self {
        Self {
            on_success: None,
            on_failure: None,
        }
    }

    fn deliver(self, state: &mut S, handle: &CompartmentHandle<S>, result: Result<T>) -> Outcome {
        match result {
            Ok(value) => {
                if let Some(cb) = self.on_success {
                    cb(state, handle, value);
                }
                Outcome::Succeeded
            }
            Err(e) if e.is_interrupted() => Outcome::Interrupted,
            Err(e) => {
                match self.on_failure {
                    Some(cb) => cb(state, handle, e),
                    None => tracing::warn!(error = %e, "task failed"),
                }
                Outcome::Failed
            }
        }
    }
}

// ── Short tasks ──────────────────────────────────────────────────────────────

pub struct Task<S, T = ()> {
    body: ShortBody<S, T>,
    callbacks: Callbacks<S, T>,
    size: SizeHint,
}

impl<S: 'static, T: 'static> Task<S, T> {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&mut S, &CompartmentHandle<S>) -> Result<T> + Send + 'static,
    {
        Self {
            body: Box::new(body),
            callbacks: Callbacks::new(),
            size: SizeHint::None,
        }
    }

    pub fn on_success<F>(mut self, cb: F) -> Self
    where
        F: FnOnce(&mut S, &CompartmentHandle<S>, T) + Send + 'static,
    {
        self.callbacks.on_success = Some(Box::new(cb));
        self
    }

    pub fn on_failure<F>(mut self, cb: F) -> Self
    where
        F: FnOnce(&mut S, &CompartmentHandle<S>, TransportError) + Send + 'static,
    {
        self.callbacks.on_failure = Some(Box::new(cb));
        self
    }

    /// Footprint used for queue accounting.
    pub fn with_size(mut self, size: SizeHint) -> Self {
        self.size = size;
        self
    }

    pub fn size_hint(&self) -> SizeHint {
        self.size
    }

    pub(crate) fn into_job(self) -> Job<S> {
        let Task {
            body, callbacks, ..
        } = self;
        Box::new(move |state, handle| {
            let result = catch_unwind(AssertUnwindSafe(|| body(state, handle)))
                .unwrap_or_else(|panic| Err(panic_fault(panic)));
            callbacks.deliver(state, handle, result)
        })
    }
}

// ── Long tasks ───────────────────────────────────────────────────────────────

pub struct LongTask<S, T = ()> {
    body: LongBody<T>,
    callbacks: Callbacks<S, T>,
    size: SizeHint,
}

impl<S: 'static, T: Send + 'static> LongTask<S, T> {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Self {
            body: Box::new(body),
            callbacks: Callbacks::new(),
            size: SizeHint::None,
        }
    }

    pub fn on_success<F>(mut self, cb: F) -> Self
    where
        F: FnOnce(&mut S, &CompartmentHandle<S>, T) + Send + 'static,
    {
        self.callbacks.on_success = Some(Box::new(cb));
        self
    }

    pub fn on_failure<F>(mut self, cb: F) -> Self
    where
        F: FnOnce(&mut S, &CompartmentHandle<S>, TransportError) + Send + 'static,
    {
        self.callbacks.on_failure = Some(Box::new(cb));
        self
    }

    /// Footprint of the completion event once it re-enters the queue.
    pub fn with_size(mut self, size: SizeHint) -> Self {
        self.size = size;
        self
    }

    /// Split into the worker-side body and the reactor-side completion.
    /// The returned closure runs the body and yields the completion job.
    pub(crate) fn into_work(self) -> (impl FnOnce() -> Job<S> + Send, SizeHint) {
        let LongTask {
            body,
            callbacks,
            size,
        } = self;
        let work = move || -> Job<S> {
            let result = catch_unwind(AssertUnwindSafe(body))
                .unwrap_or_else(|panic| Err(panic_fault(panic)));
            Box::new(move |state, handle| callbacks.deliver(state, handle, result))
        };
        (work, size)
    }
}

/// Convert a caught panic payload into an isolated fault.
pub(crate) fn panic_fault(panic: Box<dyn Any + Send>) -> TransportError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    TransportError::fault(anyhow::anyhow!("task panicked: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_faults() {
        let err = catch_unwind(|| panic!("kaboom")).map_err(panic_fault).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert!(!err.is_interrupted());

        let err = catch_unwind(|| std::panic::panic_any(17u8))
            .map_err(panic_fault)
            .unwrap_err();
        assert!(err.to_string().contains("non-string"));
    }
}
