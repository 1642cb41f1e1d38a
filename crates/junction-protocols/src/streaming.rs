//! Fragmentation and reassembly of large payloads.
//!
//! A message whose outermost part is a [`StreamPayload`] is sent as a run of
//! [`StreamingPart`] fragments of at most `max_fragment_size` bytes, one
//! sub-stream after another. The first fragment rides on the original
//! message; the rest go out as fresh messages to the same destination.
//!
//! On the pull path a stalled send parks its continuation under the
//! destination and resumes from the next fragment on `do_send_pending`.
//!
//! Incoming fragments are keyed by `(source, stream id)` and fed to a
//! [`StreamReceiveHandler`]; the reassembled message goes upstream once the
//! last fragment of the last sub-stream arrives.
//!
//! Both tables sit behind their own locks so a [`StreamCleaner`] can evict
//! streams to or from dead peers from any thread.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use junction_core::config::StreamingConfig;
use junction_core::services::{CleanupManager, NoCleanup};
use junction_core::{
    Address, Message, MessageFlags, MessagePart, ReceivedStream, Result, StreamingPart,
    StreamPayload, TransportError,
};

use crate::protocol::{Protocol, Receiver, Sender, Sink};

pub const STREAMING_PROTOCOL: &str = "streaming";

/// Flags every fragment carries: never compressed, never delayed. All three
/// are cleared again on the reassembled message.
const FRAGMENT_FLAGS: MessageFlags = MessageFlags::NO_COMPRESS
    .union(MessageFlags::NO_DELAY)
    .union(MessageFlags::STREAMED);

// ── Receive handlers ─────────────────────────────────────────────────────────

/// Consumer of one incoming stream. Calls arrive in order: `begin`, any
/// number of `append`s and `end` per sub-stream, then exactly one of
/// `complete` or `cancel`.
pub trait StreamReceiveHandler: Send + Sync {
    fn begin(&mut self, sub_stream: u32) -> Result<()>;
    fn append(&mut self, sub_stream: u32, bytes: &Bytes) -> Result<()>;
    fn end(&mut self, sub_stream: u32) -> Result<()>;
    /// The part that replaces the stream in the delivered message.
    fn complete(self: Box<Self>) -> Result<MessagePart>;
    /// The transfer was abandoned.
    fn cancel(self: Box<Self>);
}

pub trait StreamHandlerFactory: Send + Sync {
    fn create(&self, message: &Message, sub_stream_count: u32) -> Box<dyn StreamReceiveHandler>;
}

/// Buffers every sub-stream in memory and delivers a [`ReceivedStream`].
#[derive(Debug, Default)]
pub struct BufferingHandler {
    sub_streams: Vec<BytesMut>,
}

impl StreamReceiveHandler for BufferingHandler {
    fn begin(&mut self, _sub_stream: u32) -> Result<()> {
        self.sub_streams.push(BytesMut::new());
        Ok(())
    }

    fn append(&mut self, _sub_stream: u32, bytes: &Bytes) -> Result<()> {
        match self.sub_streams.last_mut() {
            Some(buffer) => {
                buffer.extend_from_slice(bytes);
                Ok(())
            }
            None => Err(stream_error("fragment before sub-stream start")),
        }
    }

    fn end(&mut self, _sub_stream: u32) -> Result<()> {
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<MessagePart> {
        let sub_streams = self.sub_streams.into_iter().map(BytesMut::freeze).collect();
        Ok(ReceivedStream { sub_streams }.into_part())
    }

    fn cancel(self: Box<Self>) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferingHandlerFactory;

/// Sub-stream slots reserved up front; more grow on demand.
const PREALLOCATED_SUB_STREAMS: usize = 64;

impl StreamHandlerFactory for BufferingHandlerFactory {
    fn create(&self, _message: &Message, sub_stream_count: u32) -> Box<dyn StreamReceiveHandler> {
        let reserve = (sub_stream_count as usize).min(PREALLOCATED_SUB_STREAMS);
        Box::new(BufferingHandler {
            sub_streams: Vec::with_capacity(reserve),
        })
    }
}

// ── Stream state ─────────────────────────────────────────────────────────────

/// Continuation of an outgoing stream.
struct StreamSendInfo {
    /// The original message, flagged, still carrying its payload part.
    message: Message,
    stream_id: u32,
    current: u32,
    count: u32,
    started: bool,
    // Next chunk of the current sub-stream, read ahead to detect its end.
    lookahead: Option<Bytes>,
}

impl StreamSendInfo {
    fn payload(&self) -> Result<&StreamPayload> {
        self.message
            .part()
            .and_then(MessagePart::as_stream_payload)
            .ok_or_else(|| stream_error("stream payload missing"))
    }

    fn is_done(&self) -> bool {
        self.current >= self.count
    }

    /// The next fragment message, or `None` once every sub-stream is sent.
    fn next_message(&mut self, max_fragment_size: usize) -> Result<Option<Message>> {
        if self.is_done() {
            return Ok(None);
        }
        let index = self.current;
        let payload = self
            .message
            .part()
            .and_then(MessagePart::as_stream_payload)
            .ok_or_else(|| stream_error("stream payload missing"))?;
        let chunk = match self.lookahead.take() {
            Some(chunk) => chunk,
            None => read_chunk(payload, index, max_fragment_size)?,
        };
        let ahead = if chunk.is_empty() {
            Bytes::new()
        } else {
            read_chunk(payload, index, max_fragment_size)?
        };
        let first = !self.started;
        let last = ahead.is_empty();
        let part = MessagePart::Streaming(StreamingPart::new(
            self.stream_id,
            index,
            self.count,
            first,
            last,
            Some(chunk),
        ));
        let message = if index == 0 && first {
            self.message.replace_part(part)
        } else {
            self.message.sibling().with_part(part)
        };
        if last {
            self.current += 1;
            self.started = false;
        } else {
            self.started = true;
            self.lookahead = Some(ahead);
        }
        Ok(Some(message))
    }

    fn cancel(self) {
        if let Ok(payload) = self.payload() {
            payload.cancel();
        }
    }
}

fn read_chunk(payload: &StreamPayload, sub_stream: u32, max: usize) -> Result<Bytes> {
    let mut buf = BytesMut::zeroed(max);
    let n = payload
        .read_full(sub_stream, &mut buf)
        .map_err(TransportError::Stream)?;
    buf.truncate(n);
    Ok(buf.freeze())
}

fn stream_error(reason: &str) -> TransportError {
    TransportError::Stream(io::Error::new(io::ErrorKind::InvalidData, reason.to_string()))
}

/// Reassembly state of an incoming stream.
struct StreamReceiveInfo {
    /// The first fragment's message with the fragment stripped.
    base: Message,
    handler: Box<dyn StreamReceiveHandler>,
    count: u32,
    next: u32,
    open: bool,
}

impl StreamReceiveInfo {
    /// Feed one fragment. `Ok(true)` once the whole stream has arrived.
    fn accept(&mut self, part: &StreamingPart) -> Result<bool> {
        let index = part.sub_stream_index();
        if part.sub_stream_count() != self.count || index != self.next {
            return Err(stream_error("fragment out of sequence"));
        }
        if part.is_first() {
            if self.open {
                return Err(stream_error("sub-stream restarted"));
            }
            self.handler.begin(index)?;
            self.open = true;
        } else if !self.open {
            return Err(stream_error("fragment before sub-stream start"));
        }
        if let Some(bytes) = part.fragment() {
            self.handler.append(index, bytes)?;
        }
        if part.is_last() {
            self.handler.end(index)?;
            self.open = false;
            self.next += 1;
        }
        Ok(part.completes_stream())
    }
}

#[derive(Default)]
struct StreamTables {
    outgoing: DashMap<Address, StreamSendInfo>,
    incoming: DashMap<(Address, u32), StreamReceiveInfo>,
}

// ── Cleanup ──────────────────────────────────────────────────────────────────

/// Evicts streams whose peer the cleanup manager has given up on. Clones
/// share the protocol's tables and may run on any thread.
#[derive(Clone)]
pub struct StreamCleaner {
    tables: Arc<StreamTables>,
    cleanup: Arc<dyn CleanupManager>,
}

impl StreamCleaner {
    /// Cancel and drop every abandoned stream. Returns how many were evicted.
    pub fn run(&self) -> usize {
        let dead_out: Vec<Address> = self
            .tables
            .outgoing
            .iter()
            .filter(|entry| self.cleanup.can_cleanup(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        let dead_in: Vec<(Address, u32)> = self
            .tables
            .incoming
            .iter()
            .filter(|entry| self.cleanup.can_cleanup(&entry.key().0))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for destination in dead_out {
            if let Some((_, info)) = self.tables.outgoing.remove(&destination) {
                tracing::warn!(%destination, stream_id = info.stream_id, "abandoned outgoing stream");
                info.cancel();
                evicted += 1;
            }
        }
        for key in dead_in {
            if let Some(((source, stream_id), info)) = self.tables.incoming.remove(&key) {
                tracing::warn!(%source, stream_id, "abandoned incoming stream");
                info.handler.cancel();
                evicted += 1;
            }
        }
        evicted
    }
}

// ── Protocol ─────────────────────────────────────────────────────────────────

pub struct StreamingProtocol {
    config: StreamingConfig,
    tables: Arc<StreamTables>,
    cleanup: Arc<dyn CleanupManager>,
    handlers: Arc<dyn StreamHandlerFactory>,
    next_stream_id: u32,
    last_cleanup: Option<Duration>,
}

enum Outgoing {
    Plain(Message),
    Stream(StreamSendInfo),
}

impl StreamingProtocol {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            tables: Arc::new(StreamTables::default()),
            cleanup: Arc::new(NoCleanup),
            handlers: Arc::new(BufferingHandlerFactory),
            next_stream_id: 1,
            last_cleanup: None,
        }
    }

    pub fn with_cleanup_manager(mut self, cleanup: impl CleanupManager + 'static) -> Self {
        self.cleanup = Arc::new(cleanup);
        self
    }

    pub fn with_handler_factory(mut self, handlers: impl StreamHandlerFactory + 'static) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn cleaner(&self) -> StreamCleaner {
        StreamCleaner {
            tables: Arc::clone(&self.tables),
            cleanup: Arc::clone(&self.cleanup),
        }
    }

    /// Outgoing streams parked on a stalled sink.
    pub fn parked_sends(&self) -> usize {
        self.tables.outgoing.len()
    }

    /// Incoming streams still being reassembled.
    pub fn partial_receives(&self) -> usize {
        self.tables.incoming.len()
    }

    fn max_fragment_size(&self) -> usize {
        self.config.max_fragment_size.max(1)
    }

    /// Reject a peer's sub-stream count before any receive state exists.
    fn check_sub_stream_count(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(stream_error("stream declares no sub-streams"));
        }
        if count > self.config.max_sub_streams {
            return Err(stream_error(&format!(
                "stream declares {count} sub-streams, limit is {}",
                self.config.max_sub_streams
            )));
        }
        Ok(())
    }

    fn prepare(&mut self, message: Message) -> Outgoing {
        let Some(payload) = message.part().and_then(MessagePart::as_stream_payload) else {
            return Outgoing::Plain(message);
        };
        let count = payload.sub_stream_count();
        if count == 0 {
            tracing::trace!(destination = %message.destination(), "empty stream payload; sent unfragmented");
            return Outgoing::Plain(message.without_part());
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1);
        tracing::debug!(destination = %message.destination(), stream_id, sub_streams = count, "stream started");
        Outgoing::Stream(StreamSendInfo {
            message: message.with_flags(FRAGMENT_FLAGS),
            stream_id,
            current: 0,
            count,
            started: false,
            lookahead: None,
        })
    }

    /// Push fragments into `sink` until the stream ends or the sink stalls.
    fn drive(&self, mut info: StreamSendInfo, sink: &mut dyn Sink) -> Result<bool> {
        let max = self.max_fragment_size();
        loop {
            let message = match info.next_message(max) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(true),
                Err(e) => {
                    info.cancel();
                    return Err(e);
                }
            };
            match sink.send(message) {
                Ok(true) => {}
                Ok(false) => {
                    if !info.is_done() {
                        self.park(sink.destination().clone(), info);
                    }
                    return Ok(false);
                }
                Err(e) => {
                    info.cancel();
                    return Err(e);
                }
            }
        }
    }

    fn park(&self, destination: Address, info: StreamSendInfo) {
        tracing::trace!(%destination, stream_id = info.stream_id, sub_stream = info.current, "stream parked");
        if let Some(previous) = self.tables.outgoing.insert(destination, info) {
            tracing::warn!(stream_id = previous.stream_id, "parked stream replaced");
            previous.cancel();
        }
    }

    fn cancel_all(&self) {
        let outgoing: Vec<Address> = self.tables.outgoing.iter().map(|e| e.key().clone()).collect();
        for destination in outgoing {
            if let Some((_, info)) = self.tables.outgoing.remove(&destination) {
                info.cancel();
            }
        }
        let incoming: Vec<(Address, u32)> =
            self.tables.incoming.iter().map(|e| e.key().clone()).collect();
        for key in incoming {
            if let Some((_, info)) = self.tables.incoming.remove(&key) {
                info.handler.cancel();
            }
        }
    }
}

impl Protocol for StreamingProtocol {
    fn name(&self) -> &str {
        STREAMING_PROTOCOL
    }

    fn stop(&mut self) -> Result<()> {
        self.cancel_all();
        Ok(())
    }

    fn on_timer(&mut self, now: Duration, _down: &mut dyn Sender, _up: &mut dyn Receiver) -> Result<()> {
        let due = self
            .last_cleanup
            .map_or(true, |last| now.saturating_sub(last) >= self.config.cleanup_period());
        if due {
            self.last_cleanup = Some(now);
            let evicted = self.cleaner().run();
            if evicted > 0 {
                tracing::debug!(evicted, "stream cleanup");
            }
        }
        Ok(())
    }

    fn do_send(&mut self, message: Message, next: &mut dyn Sender) -> Result<()> {
        let mut info = match self.prepare(message) {
            Outgoing::Plain(message) => return next.send(message),
            Outgoing::Stream(info) => info,
        };
        let max = self.max_fragment_size();
        loop {
            let sent = match info.next_message(max) {
                Ok(Some(message)) => next.send(message),
                Ok(None) => return Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                info.cancel();
                return Err(e);
            }
        }
    }

    fn do_send_to(&mut self, sink: &mut dyn Sink, message: Message) -> Result<bool> {
        match self.prepare(message) {
            Outgoing::Plain(message) => sink.send(message),
            Outgoing::Stream(info) => self.drive(info, sink),
        }
    }

    fn do_send_pending(&mut self, sink: &mut dyn Sink) -> Result<bool> {
        match self.tables.outgoing.remove(sink.destination()) {
            Some((_, info)) => self.drive(info, sink),
            None => Ok(true),
        }
    }

    fn do_receive(&mut self, message: Message, next: &mut dyn Receiver) -> Result<()> {
        let Some(part) = message.part().and_then(MessagePart::as_streaming) else {
            return next.receive(message);
        };
        let key = (message.source().clone(), part.stream_id());

        if part.is_first() && part.sub_stream_index() == 0 {
            if let Err(e) = self.check_sub_stream_count(part.sub_stream_count()) {
                tracing::warn!(source = %key.0, stream_id = key.1, error = %e, "stream refused");
                if let Some((_, previous)) = self.tables.incoming.remove(&key) {
                    previous.handler.cancel();
                }
                return Err(e);
            }
            let base = message.without_part().without_flags(FRAGMENT_FLAGS);
            let handler = self.handlers.create(&base, part.sub_stream_count());
            let info = StreamReceiveInfo {
                base,
                handler,
                count: part.sub_stream_count(),
                next: 0,
                open: false,
            };
            if let Some(previous) = self.tables.incoming.insert(key.clone(), info) {
                tracing::warn!(source = %key.0, stream_id = key.1, "stream restarted; partial data dropped");
                previous.handler.cancel();
            }
        }

        let outcome = match self.tables.incoming.get_mut(&key) {
            Some(mut entry) => entry.accept(part),
            None => {
                tracing::debug!(source = %key.0, stream_id = key.1, "fragment for unknown stream dropped");
                return Ok(());
            }
        };
        match outcome {
            Ok(false) => Ok(()),
            Ok(true) => {
                let Some((_, info)) = self.tables.incoming.remove(&key) else {
                    return Ok(());
                };
                let part = info.handler.complete()?;
                tracing::debug!(source = %key.0, stream_id = key.1, "stream reassembled");
                next.receive(info.base.with_part(part))
            }
            Err(e) => {
                if let Some((_, info)) = self.tables.incoming.remove(&key) {
                    info.handler.cancel();
                }
                Err(e)
            }
        }
    }

    fn on_unregister(&mut self, destination: &Address) {
        if let Some((_, info)) = self.tables.outgoing.remove(destination) {
            info.cancel();
        }
    }
}
