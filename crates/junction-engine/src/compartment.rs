//! The compartment reactor.
//!
//! A compartment owns a state value `S` (usually a protocol stack) and one
//! reactor thread that is the only code ever touching it. Everything else
//! talks to the compartment through a [`CompartmentHandle`]: offering short
//! tasks, submitting long tasks to the worker pool, registering processors.
//!
//! Each reactor cycle:
//!
//!   1. block in the dispatcher for up to `dispatch_period` (not at all if
//!      work is already queued)
//!   2. drain up to `task_batch_size` events, running each on this thread
//!   3. run every processor once
//!   4. run timer processors if `timer_period` has elapsed
//!
//! Long-task completions re-enter the same queue, so their callbacks run on
//! the reactor thread in enqueue order with everything else.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use junction_core::config::{CompartmentConfig, JunctionConfig, WorkerConfig};
use junction_core::services::{SystemTimeService, TimeService};
use junction_core::{DefaultSizeEstimator, Result, SizeEstimator, SizeHint, TransportError};

use crate::dispatcher::{DefaultDispatcher, Dispatcher};
use crate::flow::FlowController;
use crate::queue::{CompartmentId, CompartmentQueue, FifoQueue, QueueEvent};
use crate::task::{panic_fault, Job, LongTask, Outcome, Task};
use crate::worker::{Rejected, WorkerPool};

pub type Processor<S> = Box<dyn FnMut(&mut S, &CompartmentHandle<S>) -> Result<()> + Send>;

/// Receives the current time on each run.
pub type TimerProcessor<S> =
    Box<dyn FnMut(&mut S, &CompartmentHandle<S>, Duration) -> Result<()> + Send>;

enum Registration<S> {
    Processor(Processor<S>),
    Timer(TimerProcessor<S>),
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CompartmentStats {
    executed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    cycles: AtomicU64,
    flow_locked: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Events run to completion, failures included.
    pub executed: u64,
    pub failed: u64,
    /// Long tasks refused by the worker pool.
    pub rejected: u64,
    pub cycles: u64,
    pub flow_locked: bool,
}

impl CompartmentStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            flow_locked: self.flow_locked.load(Ordering::Acquire),
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Shared<S> {
    id: CompartmentId,
    name: String,
    config: CompartmentConfig,
    queue: Mutex<Box<dyn CompartmentQueue<S>>>,
    dispatcher: Arc<dyn Dispatcher>,
    estimator: Arc<dyn SizeEstimator>,
    flow: Option<Arc<dyn FlowController>>,
    workers: Arc<WorkerPool>,
    time: Arc<dyn TimeService>,
    registrations: Mutex<Vec<Registration<S>>>,
    stopped: AtomicBool,
    stats: CompartmentStats,
}

impl<S> Shared<S> {
    fn lock_queue(&self) -> MutexGuard<'_, Box<dyn CompartmentQueue<S>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepting(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.dispatcher.is_interrupted()
    }

    fn lock_flow_if_full(&self, capacity: usize) {
        if capacity < self.config.min_lock_queue_capacity {
            return;
        }
        if self
            .stats
            .flow_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(compartment = %self.name, capacity, "queue above high watermark");
            if let Some(flow) = &self.flow {
                flow.lock_flow();
            }
        }
    }

    fn unlock_flow_if_drained(&self) {
        let capacity = self.lock_queue().capacity();
        if capacity >= self.config.max_unlock_queue_capacity {
            return;
        }
        if self
            .stats
            .flow_locked
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(compartment = %self.name, capacity, "queue below low watermark");
            if let Some(flow) = &self.flow {
                flow.unlock_flow();
            }
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Thread-safe access to a compartment. Cheap to clone.
pub struct CompartmentHandle<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for CompartmentHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: 'static> CompartmentHandle<S> {
    pub fn id(&self) -> CompartmentId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CompartmentConfig {
        &self.shared.config
    }

    /// Queue a short task for the reactor thread. Never blocks. Returns
    /// false only once the compartment has stopped.
    ///
    /// The task is attributed to this compartment, the same origin long-task
    /// completions carry, so the two stay in offer order under any queue.
    pub fn offer<T: 'static>(&self, task: Task<S, T>) -> bool {
        let size = task.size_hint();
        self.enqueue(task.into_job(), size, Some(self.shared.id))
    }

    /// Like [`offer`](Self::offer), attributing the task to the producing
    /// compartment so grouped queues can share the reactor fairly.
    pub fn offer_from<T: 'static>(&self, origin: CompartmentId, task: Task<S, T>) -> bool {
        let size = task.size_hint();
        self.enqueue(task.into_job(), size, Some(origin))
    }

    /// Shorthand for a task without callbacks; failures are logged.
    pub fn submit<F>(&self, body: F) -> bool
    where
        F: FnOnce(&mut S, &CompartmentHandle<S>) -> Result<()> + Send + 'static,
    {
        self.offer(Task::new(body))
    }

    /// Hand a long task to the worker pool. Returns false if the pool is at
    /// capacity or the compartment has stopped; the task is dropped.
    pub fn execute<T: Send + 'static>(&self, task: LongTask<S, T>) -> bool {
        if !self.shared.accepting() {
            return false;
        }
        let (work, size) = task.into_work();
        let handle = self.clone();
        let submitted = self.shared.workers.try_submit(move || {
            let completion = work();
            let origin = Some(handle.id());
            if !handle.enqueue(completion, size, origin) {
                tracing::debug!(compartment = %handle.name(), "dropping completion after stop");
            }
        });
        match submitted {
            Ok(()) => true,
            Err(Rejected) => {
                self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(compartment = %self.shared.name, "long task rejected");
                false
            }
        }
    }

    /// Run `processor` once per reactor cycle.
    pub fn add_processor<F>(&self, processor: F)
    where
        F: FnMut(&mut S, &CompartmentHandle<S>) -> Result<()> + Send + 'static,
    {
        self.register(Registration::Processor(Box::new(processor)));
    }

    /// Run `processor` each time the timer period elapses.
    pub fn add_timer_processor<F>(&self, processor: F)
    where
        F: FnMut(&mut S, &CompartmentHandle<S>, Duration) -> Result<()> + Send + 'static,
    {
        self.register(Registration::Timer(Box::new(processor)));
    }

    fn register(&self, registration: Registration<S>) {
        self.shared
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registration);
        self.shared.dispatcher.wakeup();
    }

    /// Estimated bytes waiting in the queue.
    pub fn queue_capacity(&self) -> usize {
        self.shared.lock_queue().capacity()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock_queue().len()
    }

    pub fn is_flow_locked(&self) -> bool {
        self.shared.stats.flow_locked.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn current_time(&self) -> Duration {
        self.shared.time.current_time()
    }

    pub fn time_service(&self) -> Arc<dyn TimeService> {
        Arc::clone(&self.shared.time)
    }

    /// Ask the reactor to stop at its next blocking point.
    pub fn interrupt(&self) {
        self.shared.dispatcher.interrupt();
    }

    pub fn is_stopped(&self) -> bool {
        !self.shared.accepting()
    }

    fn enqueue(&self, job: Job<S>, hint: SizeHint, origin: Option<CompartmentId>) -> bool {
        let shared = &*self.shared;
        if !shared.accepting() {
            return false;
        }
        let size = shared.estimator.estimate(hint);
        let capacity = {
            let mut queue = shared.lock_queue();
            queue.offer(QueueEvent::new(job, size, origin));
            queue.capacity()
        };
        shared.lock_flow_if_full(capacity);
        shared.dispatcher.wakeup();
        true
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct CompartmentBuilder<S> {
    name: String,
    state: S,
    config: CompartmentConfig,
    worker_config: WorkerConfig,
    queue: Option<Box<dyn CompartmentQueue<S>>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    estimator: Option<Arc<dyn SizeEstimator>>,
    flow: Option<Arc<dyn FlowController>>,
    workers: Option<Arc<WorkerPool>>,
    time: Option<Arc<dyn TimeService>>,
}

impl<S: Send + 'static> CompartmentBuilder<S> {
    pub fn config(mut self, config: CompartmentConfig) -> Self {
        self.config = config;
        self
    }

    /// Take both the compartment and worker sections.
    pub fn junction_config(mut self, config: &JunctionConfig) -> Self {
        self.config = config.compartment.clone();
        self.worker_config = config.workers.clone();
        self
    }

    pub fn queue(mut self, queue: impl CompartmentQueue<S> + 'static) -> Self {
        self.queue = Some(Box::new(queue));
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn SizeEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn flow_controller(mut self, flow: Arc<dyn FlowController>) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Share an existing pool instead of starting a private one.
    pub fn workers(mut self, workers: Arc<WorkerPool>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn time_service(mut self, time: Arc<dyn TimeService>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn build(self) -> Result<Reactor<S>> {
        let workers = match self.workers {
            Some(w) => w,
            None => Arc::new(WorkerPool::new(&self.worker_config)?),
        };
        let time = self
            .time
            .unwrap_or_else(|| Arc::new(SystemTimeService::new()));
        let mut config = self.config;
        config.task_batch_size = config.task_batch_size.max(1);

        let shared = Arc::new(Shared {
            id: CompartmentId::next(),
            name: self.name,
            config,
            queue: Mutex::new(self.queue.unwrap_or_else(|| Box::new(FifoQueue::new()))),
            dispatcher: self
                .dispatcher
                .unwrap_or_else(|| Arc::new(DefaultDispatcher::new())),
            estimator: self
                .estimator
                .unwrap_or_else(|| Arc::new(DefaultSizeEstimator::default())),
            flow: self.flow,
            workers,
            time: Arc::clone(&time),
            registrations: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            stats: CompartmentStats::default(),
        });

        Ok(Reactor {
            state: self.state,
            handle: CompartmentHandle { shared },
            processors: Vec::new(),
            timers: Vec::new(),
            last_timer: time.current_time(),
        })
    }
}

// ── Reactor ──────────────────────────────────────────────────────────────────

/// The reactor loop and the state it owns. Drive it one cycle at a time
/// with [`run_cycle`](Self::run_cycle), or move it to its own thread with
/// [`spawn`](Self::spawn).
pub struct Reactor<S> {
    state: S,
    handle: CompartmentHandle<S>,
    processors: Vec<Processor<S>>,
    timers: Vec<TimerProcessor<S>>,
    last_timer: Duration,
}

impl<S: Send + 'static> Reactor<S> {
    pub fn handle(&self) -> &CompartmentHandle<S> {
        &self.handle
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    /// One reactor cycle. Returns the number of events run. Fails only with
    /// [`TransportError::Interrupted`].
    pub fn run_cycle(&mut self) -> Result<usize> {
        let handle = self.handle.clone();
        let shared = &*handle.shared;
        self.adopt_registrations();

        let period = if shared.lock_queue().is_empty() {
            shared.config.dispatch_period()
        } else {
            Duration::ZERO
        };
        shared.dispatcher.block(period)?;

        let mut executed = 0;
        for i in 0..shared.config.task_batch_size {
            let Some(event) = shared.lock_queue().poll(i == 0) else {
                break;
            };
            let job = event.into_job();
            let state = &mut self.state;
            let outcome = catch_unwind(AssertUnwindSafe(|| job(state, &handle)))
                .unwrap_or_else(|panic| {
                    tracing::warn!(compartment = %shared.name, error = %panic_fault(panic), "task callback panicked");
                    Outcome::Failed
                });
            executed += 1;
            shared.stats.executed.fetch_add(1, Ordering::Relaxed);
            match outcome {
                Outcome::Succeeded => {}
                Outcome::Failed => {
                    shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::Interrupted => {
                    tracing::info!(compartment = %shared.name, "task raised interruption");
                    shared.dispatcher.interrupt();
                    return Err(TransportError::Interrupted);
                }
            }
        }
        shared.unlock_flow_if_drained();

        for processor in &mut self.processors {
            let state = &mut self.state;
            isolate(&shared.name, "processor", || processor(state, &handle))?;
        }

        let now = shared.time.current_time();
        if now.saturating_sub(self.last_timer) >= shared.config.timer_period() {
            self.last_timer = now;
            for timer in &mut self.timers {
                let state = &mut self.state;
                isolate(&shared.name, "timer processor", || timer(state, &handle, now))?;
            }
        }

        shared.stats.cycles.fetch_add(1, Ordering::Relaxed);
        Ok(executed)
    }

    fn adopt_registrations(&mut self) {
        let pending = std::mem::take(
            &mut *self
                .handle
                .shared
                .registrations
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for registration in pending {
            match registration {
                Registration::Processor(p) => self.processors.push(p),
                Registration::Timer(t) => self.timers.push(t),
            }
        }
    }

    /// Cycle until interrupted, then hand back the state.
    pub fn run(mut self) -> S {
        let shared = Arc::clone(&self.handle.shared);
        tracing::info!(compartment = %shared.name, id = %shared.id, "reactor started");

        while self.run_cycle().is_ok() {}

        shared.stopped.store(true, Ordering::Release);
        let abandoned: Vec<QueueEvent<S>> = {
            let mut queue = shared.lock_queue();
            std::iter::from_fn(|| queue.poll(false)).collect()
        };
        if !abandoned.is_empty() {
            tracing::debug!(compartment = %shared.name, count = abandoned.len(), "discarding queued events");
        }
        drop(abandoned);

        tracing::info!(compartment = %shared.name, id = %shared.id, "reactor stopped");
        self.state
    }

    /// Move the reactor onto its own thread.
    pub fn spawn(self) -> Result<Compartment<S>> {
        let handle = self.handle.clone();
        let thread = std::thread::Builder::new()
            .name(format!("junction-{}", handle.name()))
            .spawn(move || self.run())
            .map_err(TransportError::fault)?;
        Ok(Compartment {
            handle,
            thread: Some(thread),
        })
    }
}

/// Run one processor call, logging faults and re-raising interruption.
fn isolate(compartment: &str, what: &str, f: impl FnOnce() -> Result<()>) -> Result<()> {
    let result = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| Err(panic_fault(panic)));
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_interrupted() => Err(e),
        Err(e) => {
            tracing::warn!(compartment, error = %e, "{what} failed");
            Ok(())
        }
    }
}

// ── Compartment ──────────────────────────────────────────────────────────────

/// A reactor running on its own thread.
pub struct Compartment<S> {
    handle: CompartmentHandle<S>,
    thread: Option<JoinHandle<S>>,
}

impl<S: Send + 'static> Compartment<S> {
    pub fn builder(name: impl Into<String>, state: S) -> CompartmentBuilder<S> {
        CompartmentBuilder {
            name: name.into(),
            state,
            config: CompartmentConfig::default(),
            worker_config: WorkerConfig::default(),
            queue: None,
            dispatcher: None,
            estimator: None,
            flow: None,
            workers: None,
            time: None,
        }
    }

    pub fn handle(&self) -> &CompartmentHandle<S> {
        &self.handle
    }

    /// Interrupt the reactor, wait for it, and return its state.
    pub fn stop(mut self) -> Result<S> {
        self.handle.interrupt();
        let thread = self.thread.take().ok_or(TransportError::Stopped)?;
        thread.join().map_err(panic_fault)
    }
}

impl<S> std::ops::Deref for Compartment<S> {
    type Target = CompartmentHandle<S>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<S> Drop for Compartment<S> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shared.dispatcher.interrupt();
            let _ = thread.join();
        }
    }
}
