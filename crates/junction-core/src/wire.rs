//! Junction wire format: the byte layout of message frames.
//!
//! These headers ARE the protocol. Every integer is big-endian, every size
//! is fixed, and each header has a compile-time size guard. Changing any of
//! them is a breaking change for every peer.
//!
//! Frame layout:
//!
//!   FrameHeader                     flags, part count
//!   repeated part_count times, outermost part first:
//!     PartHeader                    body length, type id
//!     body
//!
//! Built-in bodies start with their own fixed header (StreamingHeader,
//! CompressionHeader) followed by a length-prefixed byte region. Application
//! bodies are whatever the registered codec produced.
//!
//! Source and destination addresses are not part of the frame; the
//! transport that carries the frame knows both ends.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::address::Address;
use crate::error::{Result, TransportError};
use crate::message::{Message, MessageFlags};
use crate::part::{
    CompressionPart, MessagePart, SerializedPart, StreamingPart, COMPRESSION_PART_TYPE_ID,
    FIRST_APPLICATION_TYPE_ID, STREAMING_PART_TYPE_ID,
};
use crate::registry::SerializationRegistry;

type Be32 = U32<BigEndian>;

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// [`MessageFlags`] bits. Unknown bits are carried through untouched.
    pub flags: Be32,

    /// Number of part regions that follow.
    pub part_count: Be32,
}

assert_eq_size!(FrameHeader, [u8; 8]);

// ── Part Header ──────────────────────────────────────────────────────────────

/// Precedes every part body.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PartHeader {
    /// Body length in bytes, not including this header.
    pub length: Be32,

    /// Part type. Ids below 16 are built-in; the rest name registered codecs.
    pub type_id: Be32,
}

assert_eq_size!(PartHeader, [u8; 8]);

// ── Streaming Header ─────────────────────────────────────────────────────────

/// Body header of a streaming fragment. `fragment_len` bytes follow.
///
/// Wire size: 17 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct StreamingHeader {
    pub stream_id: Be32,
    pub sub_stream_index: Be32,
    pub sub_stream_count: Be32,

    /// Bit flags:
    ///   bit 0: first fragment of the sub-stream
    ///   bit 1: last fragment of the sub-stream
    ///   bits 2-7: reserved, must be zero
    pub flags: u8,

    /// Zero means the fragment carries no bytes.
    pub fragment_len: Be32,
}

assert_eq_size!(StreamingHeader, [u8; 17]);

pub const FRAGMENT_FIRST: u8 = 0x01;
pub const FRAGMENT_LAST: u8 = 0x02;
const FRAGMENT_RESERVED: u8 = !(FRAGMENT_FIRST | FRAGMENT_LAST);

// ── Compression Header ───────────────────────────────────────────────────────

/// Body header of a compressed frame. `compressed_len` bytes follow.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct CompressionHeader {
    /// Length of the frame once decompressed.
    pub decompressed_size: Be32,
    pub compressed_len: Be32,
}

assert_eq_size!(CompressionHeader, [u8; 8]);

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("length {0} does not fit in 32 bits")]
    LengthOverflow(usize),

    #[error("part body length {declared} does not match contents ({actual})")]
    InvalidLength { declared: usize, actual: usize },

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("declared length {declared} exceeds the limit of {limit}")]
    LimitExceeded { declared: usize, limit: usize },
}

fn be32(n: usize) -> std::result::Result<Be32, WireError> {
    u32::try_from(n)
        .map(Be32::new)
        .map_err(|_| WireError::LengthOverflow(n))
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// The addressable-free content of a message: flags and parts.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: MessageFlags,
    /// Outermost first.
    pub parts: Vec<MessagePart>,
}

impl Frame {
    pub fn into_message(self, source: Address, destination: Address) -> Message {
        Message::from_parts(source, destination, self.flags, self.parts)
    }
}

/// Encode a message's flags and parts into one frame.
pub fn encode_message(message: &Message, registry: &SerializationRegistry) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(8 + message.size() + 8 * message.part_count());
    let header = FrameHeader {
        flags: Be32::new(message.flags().bits()),
        part_count: be32(message.part_count())?,
    };
    out.put_slice(header.as_bytes());
    for part in message.parts() {
        encode_part(part, registry, &mut out)?;
    }
    Ok(out.freeze())
}

pub fn decode_frame(bytes: Bytes) -> Result<Frame> {
    let mut reader = Reader::new(bytes);
    let header: FrameHeader = reader.header()?;
    let part_count = header.part_count.get() as usize;
    // Every part needs at least its header; refuse counts the input cannot hold.
    if part_count > reader.remaining() / std::mem::size_of::<PartHeader>() {
        return Err(WireError::Truncated {
            needed: part_count * std::mem::size_of::<PartHeader>(),
            available: reader.remaining(),
        }
        .into());
    }
    let mut parts = Vec::with_capacity(part_count);
    for _ in 0..part_count {
        let part_header: PartHeader = reader.header()?;
        let body = reader.take(part_header.length.get() as usize)?;
        parts.push(decode_part(part_header.type_id.get(), body)?);
    }
    if reader.remaining() != 0 {
        return Err(WireError::InvalidLength {
            declared: reader.position(),
            actual: reader.position() + reader.remaining(),
        }
        .into());
    }
    Ok(Frame {
        flags: MessageFlags::from_bits_retain(header.flags.get()),
        parts,
    })
}

pub fn decode_message(
    source: Address,
    destination: Address,
    bytes: Bytes,
) -> Result<Message> {
    Ok(decode_frame(bytes)?.into_message(source, destination))
}

// ── Parts ────────────────────────────────────────────────────────────────────

/// Append one part region (header and body) to `out`.
pub fn encode_part(
    part: &MessagePart,
    registry: &SerializationRegistry,
    out: &mut BytesMut,
) -> Result<()> {
    let body = match part {
        MessagePart::App(app) => registry.encode(app)?,
        MessagePart::Serialized(serialized) => serialized.bytes().clone(),
        MessagePart::Streaming(fragment) => encode_streaming(fragment)?,
        MessagePart::Compression(compressed) => encode_compression(compressed)?,
    };
    let header = PartHeader {
        length: be32(body.len())?,
        type_id: Be32::new(part.type_id()),
    };
    out.put_slice(header.as_bytes());
    out.put_slice(&body);
    Ok(())
}

fn decode_part(type_id: u32, body: Bytes) -> Result<MessagePart> {
    match type_id {
        STREAMING_PART_TYPE_ID => Ok(MessagePart::Streaming(decode_streaming(body)?)),
        COMPRESSION_PART_TYPE_ID => Ok(MessagePart::Compression(decode_compression(body)?)),
        id if id >= FIRST_APPLICATION_TYPE_ID => {
            Ok(MessagePart::Serialized(SerializedPart::new(id, body)))
        }
        other => Err(TransportError::UnknownPartType(other)),
    }
}

fn encode_streaming(part: &StreamingPart) -> Result<Bytes> {
    let fragment = part.fragment().map(Bytes::as_ref).unwrap_or(&[]);
    let mut flags = 0;
    if part.is_first() {
        flags |= FRAGMENT_FIRST;
    }
    if part.is_last() {
        flags |= FRAGMENT_LAST;
    }
    let header = StreamingHeader {
        stream_id: Be32::new(part.stream_id()),
        sub_stream_index: Be32::new(part.sub_stream_index()),
        sub_stream_count: Be32::new(part.sub_stream_count()),
        flags,
        fragment_len: be32(fragment.len())?,
    };
    let mut out = BytesMut::with_capacity(std::mem::size_of::<StreamingHeader>() + fragment.len());
    out.put_slice(header.as_bytes());
    out.put_slice(fragment);
    Ok(out.freeze())
}

fn decode_streaming(body: Bytes) -> Result<StreamingPart> {
    let mut reader = Reader::new(body);
    let header: StreamingHeader = reader.header()?;
    if header.flags & FRAGMENT_RESERVED != 0 {
        return Err(WireError::ReservedFlagsSet(header.flags).into());
    }
    let fragment = reader.take(header.fragment_len.get() as usize)?;
    reader.finish()?;
    Ok(StreamingPart::new(
        header.stream_id.get(),
        header.sub_stream_index.get(),
        header.sub_stream_count.get(),
        header.flags & FRAGMENT_FIRST != 0,
        header.flags & FRAGMENT_LAST != 0,
        Some(fragment),
    ))
}

fn encode_compression(part: &CompressionPart) -> Result<Bytes> {
    let compressed = part.compressed();
    let header = CompressionHeader {
        decompressed_size: Be32::new(part.decompressed_size()),
        compressed_len: be32(compressed.len())?,
    };
    let mut out =
        BytesMut::with_capacity(std::mem::size_of::<CompressionHeader>() + compressed.len());
    out.put_slice(header.as_bytes());
    out.put_slice(compressed);
    Ok(out.freeze())
}

fn decode_compression(body: Bytes) -> Result<CompressionPart> {
    let mut reader = Reader::new(body);
    let header: CompressionHeader = reader.header()?;
    let compressed = reader.take(header.compressed_len.get() as usize)?;
    reader.finish()?;
    Ok(CompressionPart::new(header.decompressed_size.get(), compressed))
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Bounds-checked cursor over a frame. Byte regions are sliced, not copied.
struct Reader {
    buf: Bytes,
    pos: usize,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn header<H: FromBytes>(&mut self) -> std::result::Result<H, WireError> {
        let needed = std::mem::size_of::<H>();
        let header = H::read_from_prefix(&self.buf[self.pos..]).ok_or(WireError::Truncated {
            needed,
            available: self.remaining(),
        })?;
        self.pos += needed;
        Ok(header)
    }

    fn take(&mut self, n: usize) -> std::result::Result<Bytes, WireError> {
        if n > self.remaining() {
            return Err(WireError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    /// The region must have been consumed exactly.
    fn finish(&self) -> std::result::Result<(), WireError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(WireError::InvalidLength {
                declared: self.pos,
                actual: self.buf.len(),
            })
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
