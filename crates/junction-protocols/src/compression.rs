//! Transparent zstd compression of whole message frames.
//!
//! On the way down a message is wire-encoded, compressed, and replaced by a
//! message whose only part is a [`CompressionPart`]; the outer message is
//! marked `NO_COMPRESS` so nothing below compresses it twice. On the way up
//! a compressed message is decompressed and decoded back into the original.

use bytes::Bytes;

use junction_core::config::CompressionConfig;
use junction_core::wire::{self, WireError};
use junction_core::{
    CompressionPart, Message, MessageFlags, MessagePart, Result, SerializationRegistry,
    TransportError,
};

use crate::protocol::{Protocol, Receiver, Sender, Sink};

pub const COMPRESSION_PROTOCOL: &str = "compression";

pub struct CompressionProtocol {
    config: CompressionConfig,
    registry: SerializationRegistry,
}

impl CompressionProtocol {
    pub fn new(config: CompressionConfig, registry: SerializationRegistry) -> Self {
        Self { config, registry }
    }

    /// The compressed form of `message`, or `None` if it goes out as is.
    pub fn compress(&self, message: &Message) -> Result<Option<Message>> {
        if message.has_flags(MessageFlags::NO_COMPRESS)
            || message.part_count() == 0
            || message.size() < self.config.min_size
        {
            return Ok(None);
        }
        let frame = wire::encode_message(message, &self.registry)?;
        let decompressed_size =
            u32::try_from(frame.len()).map_err(|_| WireError::LengthOverflow(frame.len()))?;
        let compressed =
            zstd::bulk::compress(&frame, self.config.level).map_err(TransportError::Compression)?;
        tracing::trace!(
            destination = %message.destination(),
            raw = frame.len(),
            compressed = compressed.len(),
            "message compressed"
        );
        let part = CompressionPart::new(decompressed_size, Bytes::from(compressed))
            .with_retained(message.clone());
        let outer = Message::new(message.source().clone(), message.destination().clone())
            .set_flags(message.flags() | MessageFlags::NO_COMPRESS)
            .with_files(message.files().to_vec())
            .with_part(MessagePart::Compression(part));
        Ok(Some(outer))
    }

    /// Rebuild the message a [`CompressionPart`] stands for.
    pub fn decompress(&self, message: &Message, part: &CompressionPart) -> Result<Message> {
        if let Some(original) = part.retained() {
            return Ok(original.clone());
        }
        let expected = part.decompressed_size() as usize;
        if expected > self.config.max_decompressed_size {
            return Err(WireError::LimitExceeded {
                declared: expected,
                limit: self.config.max_decompressed_size,
            }
            .into());
        }
        let raw = zstd::bulk::decompress(part.compressed(), expected)
            .map_err(TransportError::Compression)?;
        if raw.len() != expected {
            return Err(WireError::InvalidLength {
                declared: expected,
                actual: raw.len(),
            }
            .into());
        }
        let frame = wire::decode_frame(Bytes::from(raw))?;
        Ok(frame
            .into_message(message.source().clone(), message.destination().clone())
            .with_files(message.files().to_vec()))
    }
}

impl Protocol for CompressionProtocol {
    fn name(&self) -> &str {
        COMPRESSION_PROTOCOL
    }

    fn do_send(&mut self, message: Message, next: &mut dyn Sender) -> Result<()> {
        match self.compress(&message)? {
            Some(compressed) => next.send(compressed),
            None => next.send(message),
        }
    }

    fn do_send_to(&mut self, sink: &mut dyn Sink, message: Message) -> Result<bool> {
        let outgoing = self.compress(&message)?.unwrap_or(message);
        sink.send(outgoing)
    }

    fn do_receive(&mut self, message: Message, next: &mut dyn Receiver) -> Result<()> {
        match message.part() {
            Some(MessagePart::Compression(part)) => {
                let original = self.decompress(&message, part)?;
                next.receive(original)
            }
            _ => next.receive(message),
        }
    }
}
