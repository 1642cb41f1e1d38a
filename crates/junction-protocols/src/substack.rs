//! A nested chain that presents itself to its container as one protocol.

use std::any::Any;
use std::time::Duration;

use junction_core::{Address, Message, Result};

use crate::protocol::{
    drain_pending, timer_chain, wire, ChainSink, DownChain, Protocol, ProtocolNode, Receiver,
    Sender, Sink, UpChain,
};

/// Inner protocols are listed top first. The inner chain's bottom leads to
/// whatever follows the sub-stack in its container, and its top to whatever
/// precedes it.
pub struct ProtocolSubStack {
    name: String,
    nodes: Vec<ProtocolNode>,
}

impl ProtocolSubStack {
    pub fn new(name: impl Into<String>, protocols: Vec<Box<dyn Protocol>>) -> Self {
        Self {
            name: name.into(),
            nodes: protocols.into_iter().map(ProtocolNode::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find_mut<P: Protocol + Any>(&mut self, name: &str) -> Option<&mut P> {
        self.nodes
            .iter_mut()
            .find(|node| node.name() == name)
            .and_then(ProtocolNode::downcast_mut::<P>)
    }
}

impl Protocol for ProtocolSubStack {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        wire(&mut self.nodes, true, true)?;
        for node in &mut self.nodes {
            node.start()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.stop()?;
        }
        for node in &mut self.nodes {
            node.unbind();
        }
        Ok(())
    }

    fn on_timer(&mut self, now: Duration, down: &mut dyn Sender, up: &mut dyn Receiver) -> Result<()> {
        timer_chain(&mut self.nodes, now, down, up)
    }

    fn do_send(&mut self, message: Message, next: &mut dyn Sender) -> Result<()> {
        DownChain {
            nodes: &mut self.nodes,
            bottom: next,
        }
        .send(message)
    }

    fn do_receive(&mut self, message: Message, next: &mut dyn Receiver) -> Result<()> {
        UpChain {
            nodes: &mut self.nodes,
            top: next,
        }
        .receive(message)
    }

    fn do_send_to(&mut self, sink: &mut dyn Sink, message: Message) -> Result<bool> {
        ChainSink {
            nodes: &mut self.nodes,
            bottom: sink,
        }
        .send(message)
    }

    fn do_send_pending(&mut self, sink: &mut dyn Sink) -> Result<bool> {
        drain_pending(&mut self.nodes, sink)
    }

    fn on_register(&mut self, destination: &Address) {
        for node in &mut self.nodes {
            node.register(destination);
        }
    }

    fn on_unregister(&mut self, destination: &Address) {
        for node in &mut self.nodes {
            node.unregister(destination);
        }
    }
}
