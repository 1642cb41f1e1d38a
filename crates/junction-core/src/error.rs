//! Error taxonomy shared by every junction crate.
//!
//! Four kinds of failure flow through the engine:
//!
//!   Interrupted      cooperative cancellation; always propagated
//!   stage faults     everything else raised inside a protocol callback;
//!                    logged at the protocol boundary, pipeline continues
//!   capacity         `execute` returning false; not an error value at all
//!   abandonment      stream cleanup; reported to the stream handler

use std::fmt;

use crate::wire::WireError;

/// Which side of a protocol a binding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sender,
    Receiver,
    PullableSender,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Sender => "sender",
            Direction::Receiver => "receiver",
            Direction::PullableSender => "pullable sender",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Cooperative cancellation of the reactor thread. Never swallowed.
    #[error("reactor interrupted")]
    Interrupted,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("no codec registered for part type {0}")]
    UnknownPartType(u32),

    #[error("part codec {type_id} failed: {source}")]
    Codec {
        type_id: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("stream source failed: {0}")]
    Stream(#[source] std::io::Error),

    #[error("protocol {protocol}: {direction} is already bound")]
    AlreadyBound {
        protocol: String,
        direction: Direction,
    },

    #[error("protocol {protocol}: {direction} is not bound")]
    Unbound {
        protocol: String,
        direction: Direction,
    },

    #[error("rejected: capacity exhausted")]
    Rejected,

    #[error("compartment stopped")]
    Stopped,

    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl TransportError {
    /// True for the one error kind isolation boundaries must re-raise.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TransportError::Interrupted)
    }

    /// Wrap an arbitrary error as an isolated stage fault.
    pub fn fault(err: impl Into<anyhow::Error>) -> Self {
        TransportError::Fault(err.into())
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
