//! junction-protocols: the protocol chain: stage contract, linear stacks,
//! nested sub-stacks, runtime routing, pull-based backpressure, and the
//! streaming and compression stages.

pub mod compression;
pub mod protocol;
pub mod router;
pub mod stack;
pub mod streaming;
pub mod substack;

pub use compression::{CompressionProtocol, COMPRESSION_PROTOCOL};
pub use protocol::{
    Binding, Bindings, Feed, FnReceiver, Protocol, ProtocolNode, Receiver, Registration, Sender,
    Sink, Terminal, TerminalSink, Transport,
};
pub use router::{MessageRouter, PeerPolicy, RouteId, RoutingPolicy};
pub use stack::{ProtocolStack, QueueFeed};
pub use streaming::{
    BufferingHandler, BufferingHandlerFactory, StreamCleaner, StreamHandlerFactory,
    StreamReceiveHandler, StreamingProtocol, STREAMING_PROTOCOL,
};
pub use substack::ProtocolSubStack;
