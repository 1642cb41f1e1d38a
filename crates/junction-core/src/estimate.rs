//! Queue cost estimation.
//!
//! Flow control is driven by estimated bytes, not element counts, so a few
//! large messages throttle producers the same way many small ones do.

use crate::message::Message;

/// What a queued task says about its own footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeHint {
    /// Nothing known; only the fixed per-task overhead applies.
    #[default]
    None,
    /// The task carries a message of this many estimated bytes.
    Message { size: usize, parts: usize },
    /// An explicit byte count.
    Bytes(usize),
}

impl SizeHint {
    pub fn of(message: &Message) -> Self {
        SizeHint::Message {
            size: message.size(),
            parts: message.part_count(),
        }
    }
}

pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, hint: SizeHint) -> usize;
}

/// Fixed overhead per task plus per-part bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct DefaultSizeEstimator {
    pub task_overhead: usize,
    pub part_overhead: usize,
}

/// Rough cost of a boxed closure plus its queue slot.
pub const TASK_OVERHEAD: usize = 64;

/// Rough cost of one part-list node.
pub const PART_OVERHEAD: usize = 48;

impl Default for DefaultSizeEstimator {
    fn default() -> Self {
        Self {
            task_overhead: TASK_OVERHEAD,
            part_overhead: PART_OVERHEAD,
        }
    }
}

impl SizeEstimator for DefaultSizeEstimator {
    fn estimate(&self, hint: SizeHint) -> usize {
        let payload = match hint {
            SizeHint::None => 0,
            SizeHint::Message { size, parts } => {
                size.saturating_add(parts.saturating_mul(self.part_overhead))
            }
            SizeHint::Bytes(n) => n,
        };
        self.task_overhead.saturating_add(payload)
    }
}
