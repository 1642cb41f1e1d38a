//! junction integration harness.
//!
//! Every test builds a small cluster of compartments, each hosting a
//! ProtocolStack. Stacks exchange real wire frames through an in-memory
//! transport: the sending side encodes with `junction_core::wire` and
//! offers a decode-and-receive task to the peer compartment.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=junction=debug (or trace) to watch the pipeline.

mod exchange;
mod reactor;
mod streams;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use junction_core::config::{CompartmentConfig, JunctionConfig, WorkerConfig};
use junction_core::estimate::SizeHint;
use junction_core::services::{ConnectionProvider, StaticConnectionProvider};
use junction_core::{wire, Address, AppPart, Message, MessagePart, SerializationRegistry, TransportError};
use junction_engine::{Compartment, CompartmentHandle, GroupedQueue, Task, WorkerPool};
use junction_protocols::{
    CompressionProtocol, FnReceiver, Protocol, ProtocolStack, StreamingProtocol, Transport,
};

// ── Application payload ──────────────────────────────────────────────────────

pub const NOTE_TYPE_ID: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub seq: u32,
    pub text: String,
}

pub fn note(from: &Address, to: &Address, seq: u32, text: &str) -> Message {
    let note = Note {
        seq,
        text: text.to_string(),
    };
    let size = note.text.len() + 4;
    Message::new(from.clone(), to.clone())
        .with_part(MessagePart::App(AppPart::new(NOTE_TYPE_ID, note).with_size(size)))
}

pub fn note_of(message: &Message, registry: &SerializationRegistry) -> Result<Note> {
    let part = message.part().context("message has no parts")?;
    let app = part.app(registry)?.context("not an application part")?;
    app.downcast_ref::<Note>()
        .cloned()
        .context("not a note")
}

// ── Harness ──────────────────────────────────────────────────────────────────

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `done` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

pub const WAIT: Duration = Duration::from_secs(10);

/// Reactor settings that keep tests quick.
pub fn fast_config() -> CompartmentConfig {
    CompartmentConfig {
        dispatch_period_ms: 2,
        timer_period_ms: 5,
        ..CompartmentConfig::default()
    }
}

/// Messages delivered to the top of a stack.
#[derive(Clone, Default)]
pub struct Inbox(Arc<Mutex<Vec<Message>>>);

impl Inbox {
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.0.lock().unwrap().clone()
    }

    fn receiver(&self) -> FnReceiver<impl FnMut(Message) -> junction_core::Result<()> + Send> {
        let inbox = Arc::clone(&self.0);
        FnReceiver(move |message: Message| -> junction_core::Result<()> {
            inbox.lock().unwrap().push(message);
            Ok(())
        })
    }
}

/// Connection string → the compartment listening on it.
#[derive(Clone, Default)]
pub struct Switchboard(Arc<DashMap<String, CompartmentHandle<ProtocolStack>>>);

impl Switchboard {
    fn get(&self, connection: &str) -> Option<CompartmentHandle<ProtocolStack>> {
        self.0.get(connection).map(|entry| entry.value().clone())
    }
}

/// Counters the transport keeps for one node.
#[derive(Clone, Default)]
pub struct WireStats {
    pub frames: Arc<AtomicUsize>,
    pub bytes: Arc<AtomicUsize>,
    pub stalls: Arc<AtomicUsize>,
}

impl WireStats {
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn stalls(&self) -> usize {
        self.stalls.load(Ordering::SeqCst)
    }
}

/// Encodes every message into a frame and hands it to the peer's reactor.
pub struct MemoryTransport {
    local: String,
    provider: StaticConnectionProvider,
    switchboard: Switchboard,
    registry: SerializationRegistry,
    stats: WireStats,
    // Report the transport full after every n pulled frames.
    stall_every: Option<usize>,
    offered: usize,
}

impl MemoryTransport {
    fn deliver(&mut self, message: Message) -> junction_core::Result<()> {
        let connection = self.provider.connect(message.destination())?;
        let peer = self.switchboard.get(&connection).ok_or_else(|| {
            TransportError::fault(anyhow::anyhow!("nothing listening on {connection}"))
        })?;
        let frame = wire::encode_message(&message, &self.registry)?;
        self.stats.frames.fetch_add(1, Ordering::SeqCst);
        self.stats.bytes.fetch_add(frame.len(), Ordering::SeqCst);
        tracing::trace!(%connection, len = frame.len(), "frame out");

        let size = SizeHint::of(&message);
        let source = message.source().clone();
        let destination = message.destination().clone();
        let task = Task::new(
            move |stack: &mut ProtocolStack, _: &CompartmentHandle<ProtocolStack>| {
                let message = wire::decode_message(source, destination, frame)?;
                stack.receive(message)
            },
        )
        .with_size(size);

        let accepted = match self.switchboard.get(&self.local) {
            Some(local) => peer.offer_from(local.id(), task),
            None => peer.offer(task),
        };
        if accepted {
            Ok(())
        } else {
            Err(TransportError::Stopped)
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: Message) -> junction_core::Result<()> {
        self.deliver(message)
    }

    fn offer(&mut self, message: Message) -> junction_core::Result<bool> {
        self.deliver(message)?;
        self.offered += 1;
        match self.stall_every {
            Some(n) if self.offered % n == 0 => {
                self.stats.stalls.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

pub struct Node {
    pub address: Address,
    pub compartment: Compartment<ProtocolStack>,
    pub inbox: Inbox,
    pub wire: WireStats,
}

impl Node {
    /// Run `f` against the stack on the reactor thread and wait for its result.
    pub fn query<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProtocolStack) -> junction_core::Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let failed = tx.clone();
        let task = Task::new(
            move |stack: &mut ProtocolStack, _: &CompartmentHandle<ProtocolStack>| f(stack),
        )
        .on_success(move |_, _, value| {
            let _ = tx.send(Ok(value));
        })
        .on_failure(move |_, _, error| {
            let _ = failed.send(Err(error));
        });
        anyhow::ensure!(self.compartment.offer(task), "compartment stopped");
        Ok(rx.recv_timeout(WAIT).context("query timed out")??)
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.query(move |stack| stack.send(message))
    }
}

/// Options for one node.
#[derive(Default)]
pub struct NodeOptions {
    pub stall_every: Option<usize>,
    pub config: Option<JunctionConfig>,
}

pub struct Cluster {
    pub provider: StaticConnectionProvider,
    pub registry: SerializationRegistry,
    switchboard: Switchboard,
    workers: Arc<WorkerPool>,
}

impl Cluster {
    pub fn new() -> Result<Self> {
        init_tracing();
        let registry = SerializationRegistry::new();
        registry.register_json::<Note>(NOTE_TYPE_ID)?;
        let workers = WorkerPool::new(&WorkerConfig {
            threads: 2,
            queue_capacity: 16,
        })?;
        Ok(Self {
            provider: StaticConnectionProvider::new(),
            registry,
            switchboard: Switchboard::default(),
            workers: Arc::new(workers),
        })
    }

    /// The default pipeline: streaming over compression.
    pub fn standard_protocols(&self, config: &JunctionConfig) -> Vec<Box<dyn Protocol>> {
        vec![
            Box::new(StreamingProtocol::new(config.streaming.clone())),
            Box::new(CompressionProtocol::new(
                config.compression.clone(),
                self.registry.clone(),
            )),
        ]
    }

    pub fn node(&self, name: &str) -> Result<Node> {
        let config = JunctionConfig::default();
        let protocols = self.standard_protocols(&config);
        self.node_with(name, protocols, NodeOptions::default())
    }

    pub fn node_with(
        &self,
        name: &str,
        protocols: Vec<Box<dyn Protocol>>,
        options: NodeOptions,
    ) -> Result<Node> {
        let address = Address::new(name);
        let connection = format!("mem://{name}");
        self.provider.add_route(address.clone(), connection.clone());

        let inbox = Inbox::default();
        let wire = WireStats::default();
        let transport = MemoryTransport {
            local: connection.clone(),
            provider: self.provider.clone(),
            switchboard: self.switchboard.clone(),
            registry: self.registry.clone(),
            stats: wire.clone(),
            stall_every: options.stall_every,
            offered: 0,
        };
        let mut stack = ProtocolStack::new(name, protocols)
            .with_transport(transport)
            .with_receiver(inbox.receiver());
        stack.start()?;

        let mut builder = Compartment::builder(name, stack)
            .queue(GroupedQueue::new())
            .workers(Arc::clone(&self.workers));
        builder = match &options.config {
            Some(config) => builder.junction_config(config),
            None => builder.config(fast_config()),
        };
        let reactor = builder.build()?;

        let handle = reactor.handle().clone();
        handle.add_processor(|stack: &mut ProtocolStack, _: &CompartmentHandle<ProtocolStack>| {
            stack.pull_ready().map(|_| ())
        });
        handle.add_timer_processor(
            |stack: &mut ProtocolStack, _: &CompartmentHandle<ProtocolStack>, now: Duration| {
                stack.on_timer(now)
            },
        );
        self.switchboard.0.insert(connection, handle);

        Ok(Node {
            address,
            compartment: reactor.spawn()?,
            inbox,
            wire,
        })
    }
}

/// Config overrides from a fixed table, standing in for the environment.
pub fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let table: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| table.get(key).cloned()
}
