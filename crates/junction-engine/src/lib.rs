//! junction-engine: the compartment reactor: queueing, dispatch, flow
//! control and the shared worker pool for long-running tasks.

pub mod compartment;
pub mod dispatcher;
pub mod flow;
pub mod queue;
pub mod task;
pub mod worker;

pub use compartment::{
    Compartment, CompartmentBuilder, CompartmentHandle, Processor, Reactor, StatsSnapshot,
    TimerProcessor,
};
pub use dispatcher::{DefaultDispatcher, Dispatcher};
pub use flow::{FlowController, FlowGate, NoopGate, ReentrantFlowController};
pub use queue::{CompartmentId, CompartmentQueue, FifoQueue, GroupedQueue, QueueEvent};
pub use task::{Job, LongTask, Outcome, Task};
pub use worker::{Rejected, WorkerPool};
