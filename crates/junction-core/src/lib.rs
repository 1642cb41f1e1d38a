//! junction-core: addresses, messages, the wire format and the collaborator
//! interfaces the transport engine consumes. Every other junction crate
//! depends on this one.

pub mod address;
pub mod config;
pub mod error;
pub mod estimate;
pub mod message;
pub mod part;
pub mod registry;
pub mod services;
pub mod wire;

pub use address::Address;
pub use config::{JunctionConfig, ConfigError};
pub use error::{Direction, Result, TransportError};
pub use estimate::{DefaultSizeEstimator, SizeEstimator, SizeHint};
pub use message::{Message, MessageFlags};
pub use part::{
    AppPart, CompressionPart, MessagePart, ReceivedStream, SerializedPart, StreamPayload,
    StreamSource, StreamingPart,
};
pub use registry::{JsonCodec, PartCodec, SerializationRegistry};
pub use wire::WireError;
