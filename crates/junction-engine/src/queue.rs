//! Pending-event storage for a compartment.
//!
//! Queues are not thread-safe on their own; the compartment guards them.
//! Offers never fail. Capacity is the sum of the events' estimated sizes
//! and only informs flow control.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::task::Job;

/// Identity of a compartment, used to group events by producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompartmentId(u32);

impl CompartmentId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// One queued unit of work. Immutable once offered.
pub struct QueueEvent<S> {
    job: Job<S>,
    estimated_size: usize,
    origin: Option<CompartmentId>,
}

impl<S> QueueEvent<S> {
    pub fn new(job: Job<S>, estimated_size: usize, origin: Option<CompartmentId>) -> Self {
        Self {
            job,
            estimated_size,
            origin,
        }
    }

    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    pub fn origin(&self) -> Option<CompartmentId> {
        self.origin
    }

    pub fn into_job(self) -> Job<S> {
        self.job
    }
}

pub trait CompartmentQueue<S>: Send {
    fn offer(&mut self, event: QueueEvent<S>);

    /// Next event, or `None` if nothing is available for this batch.
    /// `first_in_batch` is true on the first poll of each reactor cycle.
    fn poll(&mut self, first_in_batch: bool) -> Option<QueueEvent<S>>;

    /// Estimated bytes currently queued.
    fn capacity(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── FIFO ─────────────────────────────────────────────────────────────────────

/// Strict offer order across all producers.
pub struct FifoQueue<S> {
    events: VecDeque<QueueEvent<S>>,
    capacity: usize,
}

impl<S> FifoQueue<S> {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            capacity: 0,
        }
    }
}

impl<S> Default for FifoQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CompartmentQueue<S> for FifoQueue<S> {
    fn offer(&mut self, event: QueueEvent<S>) {
        self.capacity = self.capacity.saturating_add(event.estimated_size);
        self.events.push_back(event);
    }

    fn poll(&mut self, _first_in_batch: bool) -> Option<QueueEvent<S>> {
        let event = self.events.pop_front()?;
        self.capacity = self.capacity.saturating_sub(event.estimated_size);
        Some(event)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

// ── Grouped ──────────────────────────────────────────────────────────────────

struct Group<S> {
    origin: Option<CompartmentId>,
    events: VecDeque<QueueEvent<S>>,
}

/// Round-robin across producer groups.
///
/// Events are grouped by origin compartment. A batch starts at the next
/// group in rotation and takes up to `quantum` consecutive events from a
/// group before moving on. Order within a group is preserved; order across
/// groups is not.
///
/// A compartment's own offers and its long-task completions carry its own id
/// and share one group. Events offered with no origin form a separate group.
pub struct GroupedQueue<S> {
    groups: VecDeque<Group<S>>,
    quantum: usize,
    taken: usize,
    capacity: usize,
    len: usize,
}

pub const DEFAULT_GROUP_QUANTUM: usize = 16;

impl<S> GroupedQueue<S> {
    pub fn new() -> Self {
        Self::with_quantum(DEFAULT_GROUP_QUANTUM)
    }

    pub fn with_quantum(quantum: usize) -> Self {
        Self {
            groups: VecDeque::new(),
            quantum: quantum.max(1),
            taken: 0,
            capacity: 0,
            len: 0,
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn rotate(&mut self) {
        if let Some(group) = self.groups.pop_front() {
            if !group.events.is_empty() {
                self.groups.push_back(group);
            }
        }
        self.taken = 0;
    }
}

impl<S> Default for GroupedQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send> CompartmentQueue<S> for GroupedQueue<S> {
    fn offer(&mut self, event: QueueEvent<S>) {
        self.capacity = self.capacity.saturating_add(event.estimated_size);
        self.len += 1;
        match self.groups.iter_mut().find(|g| g.origin == event.origin) {
            Some(group) => group.events.push_back(event),
            None => self.groups.push_back(Group {
                origin: event.origin,
                events: VecDeque::from([event]),
            }),
        }
    }

    fn poll(&mut self, first_in_batch: bool) -> Option<QueueEvent<S>> {
        if self.groups.is_empty() {
            return None;
        }
        // The group at the front served the previous batch.
        if (first_in_batch && self.taken > 0) || self.taken >= self.quantum {
            self.rotate();
        }
        while self.groups.front().is_some_and(|g| g.events.is_empty()) {
            self.groups.pop_front();
            self.taken = 0;
        }
        let group = self.groups.front_mut()?;
        let event = group.events.pop_front()?;
        self.taken += 1;
        self.len -= 1;
        self.capacity = self.capacity.saturating_sub(event.estimated_size);
        if group.events.is_empty() {
            self.groups.pop_front();
            self.taken = 0;
        }
        Some(event)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.len
    }
}
