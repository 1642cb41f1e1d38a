//! Message parts: the payload layers a message is built from.
//!
//! Parts form a closed set. Protocol stages match on [`MessagePart`]
//! exhaustively instead of probing for runtime types:
//!
//!   App          an application value, already in structured form
//!   Serialized   an application value still in wire form, decoded lazily
//!   Streaming    one fragment of a large streamed payload
//!   Compression  a whole compressed message frame

use std::any::Any;
use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::{Buf, Bytes};

use crate::error::Result;
use crate::message::Message;
use crate::registry::SerializationRegistry;

// ── Part type identifiers ────────────────────────────────────────────────────

/// Wire type id of [`StreamingPart`].
pub const STREAMING_PART_TYPE_ID: u32 = 1;

/// Wire type id of [`CompressionPart`].
pub const COMPRESSION_PART_TYPE_ID: u32 = 2;

/// Type id of the [`StreamPayload`] application part. Never put on the wire;
/// the streaming stage replaces it with fragments.
pub const STREAM_PAYLOAD_TYPE_ID: u32 = 3;

/// Type id of the [`ReceivedStream`] part produced by reassembly.
pub const RECEIVED_STREAM_TYPE_ID: u32 = 4;

/// Application codecs must use ids at or above this value.
pub const FIRST_APPLICATION_TYPE_ID: u32 = 16;

/// Fixed per-part overhead on the wire: u32 length + u32 type id.
pub const PART_HEADER_SIZE: usize = 8;

/// Fixed StreamingPart header: three u32 fields, one flag byte, u32 length.
pub const STREAMING_HEADER_SIZE: usize = 17;

/// Fixed CompressionPart header: u32 decompressed size + u32 length.
pub const COMPRESSION_HEADER_SIZE: usize = 8;

// ── MessagePart ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum MessagePart {
    App(AppPart),
    Serialized(SerializedPart),
    Streaming(StreamingPart),
    Compression(CompressionPart),
}

impl MessagePart {
    /// Wrap a large payload so the streaming stage fragments it.
    pub fn stream(payload: StreamPayload) -> Self {
        MessagePart::App(AppPart::new(STREAM_PAYLOAD_TYPE_ID, payload).with_size(0))
    }

    pub fn type_id(&self) -> u32 {
        match self {
            MessagePart::App(p) => p.type_id(),
            MessagePart::Serialized(p) => p.type_id(),
            MessagePart::Streaming(_) => STREAMING_PART_TYPE_ID,
            MessagePart::Compression(_) => COMPRESSION_PART_TYPE_ID,
        }
    }

    /// Estimated size in bytes, used for queue accounting.
    pub fn size(&self) -> usize {
        match self {
            MessagePart::App(p) => p.size(),
            MessagePart::Serialized(p) => p.bytes().len(),
            MessagePart::Streaming(p) => p.size(),
            MessagePart::Compression(p) => p.size(),
        }
    }

    /// The stream payload carried by this part, if any.
    pub fn as_stream_payload(&self) -> Option<&StreamPayload> {
        match self {
            MessagePart::App(p) => p.downcast_ref::<StreamPayload>(),
            _ => None,
        }
    }

    pub fn as_streaming(&self) -> Option<&StreamingPart> {
        match self {
            MessagePart::Streaming(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_compression(&self) -> Option<&CompressionPart> {
        match self {
            MessagePart::Compression(p) => Some(p),
            _ => None,
        }
    }

    /// Structured application value, decoding a serialized part on demand.
    pub fn app<'a>(&'a self, registry: &SerializationRegistry) -> Result<Option<&'a AppPart>> {
        match self {
            MessagePart::App(p) => Ok(Some(p)),
            MessagePart::Serialized(p) => p.deserialize(registry).map(Some),
            MessagePart::Streaming(_) | MessagePart::Compression(_) => Ok(None),
        }
    }
}

// ── Application parts ────────────────────────────────────────────────────────

/// An application value in structured form.
#[derive(Clone)]
pub struct AppPart {
    type_id: u32,
    size: usize,
    value: Arc<dyn Any + Send + Sync>,
}

impl AppPart {
    pub fn new<T: Any + Send + Sync>(type_id: u32, value: T) -> Self {
        Self {
            type_id,
            size: std::mem::size_of::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn from_arc(type_id: u32, value: Arc<dyn Any + Send + Sync>, size: usize) -> Self {
        Self {
            type_id,
            size,
            value,
        }
    }

    /// Override the size estimate (the default is the in-memory size of `T`).
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn value(&self) -> &(dyn Any + Send + Sync) {
        self.value.as_ref()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().downcast_ref::<T>()
    }

    /// True when both parts share the same value allocation.
    pub fn ptr_eq(&self, other: &AppPart) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for AppPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppPart")
            .field("type_id", &self.type_id)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// An application value still in wire form.
///
/// Decoding happens the first time a consumer asks for the structured value;
/// the result is cached and shared by every clone of this part.
#[derive(Clone)]
pub struct SerializedPart {
    type_id: u32,
    bytes: Bytes,
    decoded: Arc<OnceLock<AppPart>>,
}

impl SerializedPart {
    pub fn new(type_id: u32, bytes: Bytes) -> Self {
        Self {
            type_id,
            bytes,
            decoded: Arc::new(OnceLock::new()),
        }
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }

    pub fn deserialize(&self, registry: &SerializationRegistry) -> Result<&AppPart> {
        if let Some(part) = self.decoded.get() {
            return Ok(part);
        }
        let part = registry.decode(self.type_id, &self.bytes)?;
        // Another clone may have raced us; either value is equivalent.
        Ok(self.decoded.get_or_init(|| part))
    }
}

impl fmt::Debug for SerializedPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedPart")
            .field("type_id", &self.type_id)
            .field("len", &self.bytes.len())
            .field("decoded", &self.is_decoded())
            .finish()
    }
}

// ── Streaming fragments ──────────────────────────────────────────────────────

/// One fragment of a streamed payload.
///
/// `fragment` is `None` for a terminal fragment that carries no bytes (an
/// empty sub-stream). Empty byte slices are normalised to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingPart {
    stream_id: u32,
    sub_stream_index: u32,
    sub_stream_count: u32,
    first: bool,
    last: bool,
    fragment: Option<Bytes>,
}

impl StreamingPart {
    pub fn new(
        stream_id: u32,
        sub_stream_index: u32,
        sub_stream_count: u32,
        first: bool,
        last: bool,
        fragment: Option<Bytes>,
    ) -> Self {
        Self {
            stream_id,
            sub_stream_index,
            sub_stream_count,
            first,
            last,
            fragment: fragment.filter(|b| !b.is_empty()),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn sub_stream_index(&self) -> u32 {
        self.sub_stream_index
    }

    pub fn sub_stream_count(&self) -> u32 {
        self.sub_stream_count
    }

    pub fn is_first(&self) -> bool {
        self.first
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Last fragment of the last sub-stream: the payload is complete.
    pub fn completes_stream(&self) -> bool {
        self.last && self.sub_stream_index + 1 >= self.sub_stream_count
    }

    pub fn fragment(&self) -> Option<&Bytes> {
        self.fragment.as_ref()
    }

    pub fn fragment_len(&self) -> usize {
        self.fragment.as_ref().map_or(0, |b| b.len())
    }

    pub fn size(&self) -> usize {
        STREAMING_HEADER_SIZE + self.fragment_len()
    }
}

// ── Compression ──────────────────────────────────────────────────────────────

/// A compressed message frame.
///
/// `retained` keeps the pre-compression message on the sending side so a
/// local consumer can use it without decompressing. It never crosses the wire.
#[derive(Clone)]
pub struct CompressionPart {
    decompressed_size: u32,
    compressed: Bytes,
    retained: Option<Arc<Message>>,
}

impl CompressionPart {
    pub fn new(decompressed_size: u32, compressed: Bytes) -> Self {
        Self {
            decompressed_size,
            compressed,
            retained: None,
        }
    }

    pub fn with_retained(mut self, original: Message) -> Self {
        self.retained = Some(Arc::new(original));
        self
    }

    pub fn decompressed_size(&self) -> u32 {
        self.decompressed_size
    }

    pub fn compressed(&self) -> &Bytes {
        &self.compressed
    }

    pub fn retained(&self) -> Option<&Message> {
        self.retained.as_deref()
    }

    pub fn size(&self) -> usize {
        COMPRESSION_HEADER_SIZE + self.compressed.len()
    }
}

impl fmt::Debug for CompressionPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionPart")
            .field("decompressed_size", &self.decompressed_size)
            .field("compressed_len", &self.compressed.len())
            .field("retained", &self.retained.is_some())
            .finish()
    }
}

// ── Stream payloads ──────────────────────────────────────────────────────────

/// Pull-style reader for the bytes of each sub-stream.
///
/// `read` behaves like [`std::io::Read::read`] for the given sub-stream:
/// `Ok(0)` means the sub-stream is exhausted.
pub trait StreamSource: Send {
    fn read(&mut self, sub_stream: u32, buf: &mut [u8]) -> io::Result<usize>;

    /// The transfer was abandoned before completion.
    fn cancel(&mut self) {}
}

/// Application part declaring a payload split into `sub_stream_count`
/// sub-streams that are read on demand.
pub struct StreamPayload {
    sub_stream_count: u32,
    source: Mutex<Box<dyn StreamSource>>,
}

impl StreamPayload {
    pub fn new(sub_stream_count: u32, source: impl StreamSource + 'static) -> Self {
        Self {
            sub_stream_count,
            source: Mutex::new(Box::new(source)),
        }
    }

    /// In-memory payload, one sub-stream per buffer.
    pub fn from_buffers(buffers: Vec<Bytes>) -> Self {
        let count = buffers.len() as u32;
        Self::new(count, BytesSource::new(buffers))
    }

    /// One sub-stream per reader, read on demand as fragments go out.
    pub fn from_readers<R: Read + Send + 'static>(readers: Vec<R>) -> Self {
        let count = readers.len() as u32;
        Self::new(count, ReaderSource::new(readers))
    }

    pub fn sub_stream_count(&self) -> u32 {
        self.sub_stream_count
    }

    /// Fill `buf` as far as the sub-stream allows. Returns the bytes read;
    /// fewer than `buf.len()` only at the end of the sub-stream.
    pub fn read_full(&self, sub_stream: u32, buf: &mut [u8]) -> io::Result<usize> {
        let mut source = self
            .source
            .lock()
            .map_err(|_| io::Error::other("stream source lock poisoned"))?;
        let mut filled = 0;
        while filled < buf.len() {
            match source.read(sub_stream, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub fn cancel(&self) {
        if let Ok(mut source) = self.source.lock() {
            source.cancel();
        }
    }
}

impl fmt::Debug for StreamPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPayload")
            .field("sub_stream_count", &self.sub_stream_count)
            .finish_non_exhaustive()
    }
}

/// [`StreamSource`] over in-memory buffers.
pub struct BytesSource {
    sub_streams: Vec<Bytes>,
}

impl BytesSource {
    pub fn new(sub_streams: Vec<Bytes>) -> Self {
        Self { sub_streams }
    }
}

impl StreamSource for BytesSource {
    fn read(&mut self, sub_stream: u32, buf: &mut [u8]) -> io::Result<usize> {
        let Some(remaining) = self.sub_streams.get_mut(sub_stream as usize) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no sub-stream {sub_stream}"),
            ));
        };
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        remaining.advance(n);
        Ok(n)
    }
}

/// [`StreamSource`] over one reader per sub-stream.
pub struct ReaderSource<R> {
    readers: Vec<R>,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(readers: Vec<R>) -> Self {
        Self { readers }
    }
}

impl<R: Read + Send> StreamSource for ReaderSource<R> {
    fn read(&mut self, sub_stream: u32, buf: &mut [u8]) -> io::Result<usize> {
        match self.readers.get_mut(sub_stream as usize) {
            Some(reader) => reader.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no sub-stream {sub_stream}"),
            )),
        }
    }
}

/// Reassembled payload delivered by the default receive handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedStream {
    pub sub_streams: Vec<Bytes>,
}

impl ReceivedStream {
    pub fn total_len(&self) -> usize {
        self.sub_streams.iter().map(Bytes::len).sum()
    }

    /// All sub-streams joined in order.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for s in &self.sub_streams {
            out.extend_from_slice(s);
        }
        out
    }

    pub fn into_part(self) -> MessagePart {
        let size = self.total_len();
        MessagePart::App(AppPart::new(RECEIVED_STREAM_TYPE_ID, self).with_size(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_part_normalises_empty_fragment() {
        let part = StreamingPart::new(1, 0, 1, true, true, Some(Bytes::new()));
        assert!(part.fragment().is_none());
        assert_eq!(part.size(), STREAMING_HEADER_SIZE);
        assert!(part.completes_stream());
    }

    #[test]
    fn completes_stream_only_on_last_sub_stream() {
        let mid = StreamingPart::new(9, 0, 2, false, true, Some(Bytes::from_static(b"x")));
        let end = StreamingPart::new(9, 1, 2, false, true, None);
        assert!(!mid.completes_stream());
        assert!(end.completes_stream());
    }

    #[test]
    fn stream_payload_reads_each_sub_stream_to_exhaustion() {
        let payload = StreamPayload::from_buffers(vec![
            Bytes::from_static(b"hello"),
            Bytes::from_static(b"world!"),
        ]);
        let mut buf = [0u8; 4];
        assert_eq!(payload.read_full(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"hell");
        assert_eq!(payload.read_full(0, &mut buf).unwrap(), 1);
        assert_eq!(payload.read_full(0, &mut buf).unwrap(), 0);
        assert_eq!(payload.read_full(1, &mut buf).unwrap(), 4);
        assert!(payload.read_full(2, &mut buf).is_err());
    }

    #[test]
    fn reader_source_fills_across_short_reads() {
        // Chain yields the two halves through separate read calls.
        let reader = Read::chain(io::Cursor::new(b"ab".to_vec()), io::Cursor::new(b"cd".to_vec()));
        let payload = StreamPayload::from_readers(vec![reader]);
        let mut buf = [0u8; 8];
        assert_eq!(payload.read_full(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn stream_part_is_recognised() {
        let part = MessagePart::stream(StreamPayload::from_buffers(vec![Bytes::new()]));
        assert_eq!(part.type_id(), STREAM_PAYLOAD_TYPE_ID);
        assert_eq!(part.as_stream_payload().unwrap().sub_stream_count(), 1);
    }

    #[test]
    fn received_stream_concats_in_order() {
        let received = ReceivedStream {
            sub_streams: vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
        };
        assert_eq!(received.concat(), b"abcd");
        assert_eq!(received.into_part().size(), 4);
    }
}
