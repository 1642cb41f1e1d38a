//! The top-level protocol chain.
//!
//! A [`ProtocolStack`] owns an ordered list of protocols, top first, plus the
//! two collaborators at its ends: the [`Transport`] under the bottom stage and
//! the application [`Receiver`] over the top stage. It is meant to be the
//! state value of a compartment, so every call runs on one reactor thread.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use junction_core::{Address, Message, Result};

use crate::protocol::{
    pull_chain, timer_chain, wire, ChainSink, DownChain, Feed, Protocol, ProtocolNode, Receiver,
    Sender, Sink, Transport, UpChain,
};

pub struct ProtocolStack {
    name: String,
    nodes: Vec<ProtocolNode>,
    transport: Option<Box<dyn Transport>>,
    receiver: Option<Box<dyn Receiver + Send>>,
    feeds: HashMap<Address, Box<dyn Feed>>,
    // Whether the chain wants to be pulled for a destination.
    interest: HashMap<Address, bool>,
    started: bool,
}

impl ProtocolStack {
    /// `protocols` are listed top (closest to the application) first.
    pub fn new(name: impl Into<String>, protocols: Vec<Box<dyn Protocol>>) -> Self {
        Self {
            name: name.into(),
            nodes: protocols.into_iter().map(ProtocolNode::new).collect(),
            transport: None,
            receiver: None,
            feeds: HashMap::new(),
            interest: HashMap::new(),
            started: false,
        }
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn with_receiver(mut self, receiver: impl Receiver + Send + 'static) -> Self {
        self.receiver = Some(Box::new(receiver));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Protocol names, top first.
    pub fn protocol_names(&self) -> Vec<&str> {
        self.nodes.iter().map(ProtocolNode::name).collect()
    }

    /// Wire the chain and start every stage. Wiring happens once; a second
    /// call fails with `AlreadyBound`.
    pub fn start(&mut self) -> Result<()> {
        wire(&mut self.nodes, true, true)?;
        for node in &mut self.nodes {
            node.start()?;
        }
        self.started = true;
        tracing::info!(stack = %self.name, protocols = ?self.protocol_names(), "protocol stack started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.stop()?;
        }
        self.started = false;
        tracing::info!(stack = %self.name, "protocol stack stopped");
        Ok(())
    }

    // ── push path ──

    /// Send `message` down through every stage to the transport.
    pub fn send(&mut self, message: Message) -> Result<()> {
        let mut bottom = TransportSender(self.transport.as_mut());
        DownChain {
            nodes: &mut self.nodes,
            bottom: &mut bottom,
        }
        .send(message)
    }

    /// Deliver a message from the transport up through every stage.
    pub fn receive(&mut self, message: Message) -> Result<()> {
        let mut top = TopReceiver(self.receiver.as_mut());
        UpChain {
            nodes: &mut self.nodes,
            top: &mut top,
        }
        .receive(message)
    }

    pub fn on_timer(&mut self, now: Duration) -> Result<()> {
        let mut bottom = TransportSender(self.transport.as_mut());
        let mut top = TopReceiver(self.receiver.as_mut());
        timer_chain(&mut self.nodes, now, &mut bottom, &mut top)
    }

    // ── pull path ──

    /// Register `feed` to be pulled for `destination`. Replaces any feed
    /// already registered there.
    pub fn register(&mut self, destination: Address, feed: impl Feed + 'static) {
        for node in &mut self.nodes {
            node.register(&destination);
        }
        self.interest.insert(destination.clone(), true);
        if let Some(transport) = self.transport.as_mut() {
            transport.register(&destination);
            transport.set_ready(&destination, true);
        }
        tracing::debug!(stack = %self.name, %destination, "feed registered");
        self.feeds.insert(destination, Box::new(feed));
    }

    pub fn unregister(&mut self, destination: &Address) -> Option<Box<dyn Feed>> {
        for node in &mut self.nodes {
            node.unregister(destination);
        }
        self.interest.remove(destination);
        if let Some(transport) = self.transport.as_mut() {
            transport.unregister(destination);
        }
        self.feeds.remove(destination)
    }

    /// The feed for `destination` has (or no longer has) messages to hand out.
    pub fn set_ready(&mut self, destination: &Address, ready: bool) {
        if !self.feeds.contains_key(destination) {
            return;
        }
        let Some(interest) = self.interest.get_mut(destination) else {
            return;
        };
        let mut bottom = TransportSink {
            destination: destination.clone(),
            transport: self.transport.as_mut(),
            interest,
        };
        ChainSink {
            nodes: &mut self.nodes,
            bottom: &mut bottom,
        }
        .set_ready(ready);
    }

    /// The transport can take one more message for `destination`.
    pub fn pull(&mut self, destination: &Address) -> Result<()> {
        let Some(feed) = self.feeds.get_mut(destination) else {
            return Ok(());
        };
        let Some(interest) = self.interest.get_mut(destination) else {
            return Ok(());
        };
        let mut bottom = TransportSink {
            destination: destination.clone(),
            transport: self.transport.as_mut(),
            interest,
        };
        pull_chain(&mut self.nodes, &mut bottom, feed.as_mut())
    }

    /// Pull once for every destination that currently wants to be pulled.
    /// Returns how many destinations were pulled.
    pub fn pull_ready(&mut self) -> Result<usize> {
        let ready: Vec<Address> = self
            .interest
            .iter()
            .filter(|(_, wanted)| **wanted)
            .map(|(destination, _)| destination.clone())
            .collect();
        for destination in &ready {
            self.pull(destination)?;
        }
        Ok(ready.len())
    }

    pub fn wants_pull(&self, destination: &Address) -> bool {
        self.interest.get(destination).copied().unwrap_or(false)
    }

    // ── lookup ──

    /// The protocol named `name`, if it is a `P`.
    pub fn find_mut<P: Protocol + Any>(&mut self, name: &str) -> Option<&mut P> {
        self.nodes
            .iter_mut()
            .find(|node| node.name() == name)
            .and_then(ProtocolNode::downcast_mut::<P>)
    }

    pub fn node(&self, name: &str) -> Option<&ProtocolNode> {
        self.nodes.iter().find(|node| node.name() == name)
    }
}

// ── Stack ends ───────────────────────────────────────────────────────────────

struct TransportSender<'a>(Option<&'a mut Box<dyn Transport>>);

impl Sender for TransportSender<'_> {
    fn send(&mut self, message: Message) -> Result<()> {
        match self.0.as_mut() {
            Some(transport) => transport.send(message),
            None => {
                tracing::trace!(destination = %message.destination(), "no transport; dropped");
                Ok(())
            }
        }
    }
}

struct TopReceiver<'a>(Option<&'a mut Box<dyn Receiver + Send>>);

impl Receiver for TopReceiver<'_> {
    fn receive(&mut self, message: Message) -> Result<()> {
        match self.0.as_mut() {
            Some(receiver) => receiver.receive(message),
            None => {
                tracing::trace!(source = %message.source(), "no receiver; dropped");
                Ok(())
            }
        }
    }
}

struct TransportSink<'a> {
    destination: Address,
    transport: Option<&'a mut Box<dyn Transport>>,
    interest: &'a mut bool,
}

impl Sink for TransportSink<'_> {
    fn destination(&self) -> &Address {
        &self.destination
    }

    fn send(&mut self, message: Message) -> Result<bool> {
        match self.transport.as_mut() {
            Some(transport) => transport.offer(message),
            None => {
                tracing::trace!(destination = %self.destination, "no transport; dropped");
                Ok(true)
            }
        }
    }

    fn set_ready(&mut self, ready: bool) {
        if *self.interest == ready {
            return;
        }
        *self.interest = ready;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_ready(&self.destination, ready);
        }
    }
}

// ── Queue feed ───────────────────────────────────────────────────────────────

/// FIFO [`Feed`] the application fills from its side. Clones share the
/// queue. After pushing, call [`ProtocolStack::set_ready`] for the
/// destination so the stack pulls again.
#[derive(Clone, Default)]
pub struct QueueFeed {
    queue: Arc<Mutex<VecDeque<Message>>>,
}

impl QueueFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.lock().push_back(message);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Feed for QueueFeed {
    fn feed(&mut self, sink: &mut dyn Sink) -> Result<()> {
        let (next, drained) = {
            let mut queue = self.lock();
            let next = queue.pop_front();
            (next, queue.is_empty())
        };
        if let Some(message) = next {
            sink.send(message)?;
        }
        if drained {
            sink.set_ready(false);
        }
        Ok(())
    }
}
