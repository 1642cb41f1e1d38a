//! Protocol trait and the plumbing that threads messages through a chain.
//!
//! A protocol never holds references to its neighbours. The chain owns every
//! stage as a [`ProtocolNode`], and each call hands the stage the rest of the
//! chain as a borrowed [`Sender`], [`Receiver`] or [`Sink`]:
//!
//!   send     top → bottom, through `do_send`
//!   receive  bottom → top, through `do_receive`
//!   pull     bottom asks for work, `do_send_pending` resumes parked sends,
//!            then the feed at the top hands a message to `do_send_to`
//!
//! Stage faults are isolated at the node: logged, and the message dropped.
//! Only [`TransportError::Interrupted`] escapes a node. Start failures are
//! not isolated; a stack that cannot start reports it to the caller.

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use junction_core::{Address, Direction, Message, Result, TransportError};

// ── Endpoints ────────────────────────────────────────────────────────────────

/// Push-path downstream.
pub trait Sender {
    fn send(&mut self, message: Message) -> Result<()>;
}

/// Upstream.
pub trait Receiver {
    fn receive(&mut self, message: Message) -> Result<()>;
}

/// Permission to push toward one destination.
pub trait Sink {
    fn destination(&self) -> &Address;

    /// `Ok(true)` if the message was fully accepted. `Ok(false)` if it was
    /// taken but derived units are still pending below; the caller must not
    /// send again until it is fed again.
    fn send(&mut self, message: Message) -> Result<bool>;

    /// Tell the layers below whether the caller has anything to send.
    fn set_ready(&mut self, ready: bool);
}

/// Pull callback registered for one destination. Invoked when the layers
/// below can take one more message.
pub trait Feed: Send {
    fn feed(&mut self, sink: &mut dyn Sink) -> Result<()>;
}

/// The byte-stream collaborator under the bottom of a stack.
pub trait Transport: Send {
    /// Push-path delivery.
    fn send(&mut self, message: Message) -> Result<()>;

    /// Pull-path delivery. `Ok(false)` means accepted, but the transport is
    /// now full for this destination.
    fn offer(&mut self, message: Message) -> Result<bool>;

    /// Whether the stack wants to be pulled for `destination`.
    fn set_ready(&mut self, _destination: &Address, _ready: bool) {}

    fn register(&mut self, _destination: &Address) {}

    fn unregister(&mut self, _destination: &Address) {}
}

// ── Terminal ─────────────────────────────────────────────────────────────────

/// No-op terminus for an unwired chain end. Messages sent into it are
/// dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct Terminal;

impl Sender for Terminal {
    fn send(&mut self, message: Message) -> Result<()> {
        tracing::trace!(destination = %message.destination(), "dropped at terminal sender");
        Ok(())
    }
}

impl Receiver for Terminal {
    fn receive(&mut self, message: Message) -> Result<()> {
        tracing::trace!(source = %message.source(), "dropped at terminal receiver");
        Ok(())
    }
}

/// Terminal [`Sink`] for one destination. Accepts everything.
#[derive(Debug, Clone)]
pub struct TerminalSink {
    destination: Address,
}

impl TerminalSink {
    pub fn new(destination: Address) -> Self {
        Self { destination }
    }
}

impl Sink for TerminalSink {
    fn destination(&self) -> &Address {
        &self.destination
    }

    fn send(&mut self, message: Message) -> Result<bool> {
        tracing::trace!(destination = %message.destination(), "dropped at terminal sink");
        Ok(true)
    }

    fn set_ready(&mut self, _ready: bool) {}
}

/// Adapts a closure into a top-of-stack [`Receiver`].
pub struct FnReceiver<F>(pub F);

impl<F: FnMut(Message) -> Result<()>> Receiver for FnReceiver<F> {
    fn receive(&mut self, message: Message) -> Result<()> {
        (self.0)(message)
    }
}

// ── Protocol ─────────────────────────────────────────────────────────────────

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One pipeline stage.
///
/// Every hook defaults to plain forwarding, so a stage only overrides what
/// it changes. Hooks run on the owning compartment's reactor thread.
pub trait Protocol: AsAny + Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Periodic callback. `down` and `up` are the chain below and above.
    fn on_timer(
        &mut self,
        _now: Duration,
        _down: &mut dyn Sender,
        _up: &mut dyn Receiver,
    ) -> Result<()> {
        Ok(())
    }

    fn do_send(&mut self, message: Message, next: &mut dyn Sender) -> Result<()> {
        next.send(message)
    }

    fn do_receive(&mut self, message: Message, next: &mut dyn Receiver) -> Result<()> {
        next.receive(message)
    }

    /// Pull-path send. Return `Ok(false)` to keep the slot busy until
    /// `do_send_pending` reports completion.
    fn do_send_to(&mut self, sink: &mut dyn Sink, message: Message) -> Result<bool> {
        sink.send(message)
    }

    /// Resume a parked pull-path send. `Ok(true)` once nothing is left.
    fn do_send_pending(&mut self, _sink: &mut dyn Sink) -> Result<bool> {
        Ok(true)
    }

    /// A feed was registered above for `destination`.
    fn on_register(&mut self, _destination: &Address) {}

    fn on_unregister(&mut self, _destination: &Address) {}
}

// ── Bindings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    #[default]
    Unbound,
    /// Chain end: sends into it are dropped.
    Terminal,
    /// Wired to a neighbour.
    Linked,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bindings {
    pub sender: Binding,
    pub receiver: Binding,
    pub pullable_sender: Binding,
}

/// Per-destination pull state of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registration {
    /// The layer above has something to send.
    pub ready: bool,
    /// This node parked a partial send.
    pub has_pending: bool,
}

// ── Node ─────────────────────────────────────────────────────────────────────

/// A protocol plus the chain bookkeeping around it.
pub struct ProtocolNode {
    protocol: Box<dyn Protocol>,
    bindings: Bindings,
    registrations: HashMap<Address, Registration>,
}

impl ProtocolNode {
    pub fn new(protocol: Box<dyn Protocol>) -> Self {
        Self {
            protocol,
            bindings: Bindings::default(),
            registrations: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.protocol.name()
    }

    pub fn bindings(&self) -> Bindings {
        self.bindings
    }

    pub fn protocol(&self) -> &dyn Protocol {
        self.protocol.as_ref()
    }

    pub fn protocol_mut(&mut self) -> &mut dyn Protocol {
        self.protocol.as_mut()
    }

    pub fn into_protocol(self) -> Box<dyn Protocol> {
        self.protocol
    }

    /// Typed access to the protocol, if it is a `P`.
    pub fn downcast_mut<P: Protocol + Any>(&mut self) -> Option<&mut P> {
        let protocol: &mut dyn Protocol = self.protocol.as_mut();
        protocol.as_any_mut().downcast_mut::<P>()
    }

    pub fn set_sender(&mut self, binding: Binding) -> Result<()> {
        let name = self.protocol.name().to_string();
        bind(&mut self.bindings.sender, binding, name, Direction::Sender)
    }

    pub fn set_receiver(&mut self, binding: Binding) -> Result<()> {
        let name = self.protocol.name().to_string();
        bind(&mut self.bindings.receiver, binding, name, Direction::Receiver)
    }

    pub fn set_pullable_sender(&mut self, binding: Binding) -> Result<()> {
        let name = self.protocol.name().to_string();
        bind(&mut self.bindings.pullable_sender, binding, name, Direction::PullableSender)
    }

    /// Forget the wiring so the node can be wired into another chain.
    pub(crate) fn unbind(&mut self) {
        self.bindings = Bindings::default();
    }

    pub fn registration(&self, destination: &Address) -> Option<Registration> {
        self.registrations.get(destination).copied()
    }

    fn registration_mut(&mut self, destination: &Address) -> &mut Registration {
        self.registrations.entry(destination.clone()).or_default()
    }

    fn require(&self, binding: Binding, direction: Direction) -> Result<()> {
        match binding {
            Binding::Unbound => Err(TransportError::Unbound {
                protocol: self.protocol.name().to_string(),
                direction,
            }),
            Binding::Terminal | Binding::Linked => Ok(()),
        }
    }

    fn isolate<T>(&self, op: &str, result: Result<T>, fallback: T) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) if e.is_interrupted() => Err(e),
            Err(e) => {
                tracing::warn!(protocol = %self.protocol.name(), op, error = %e, "protocol fault isolated");
                Ok(fallback)
            }
        }
    }

    // ── chain operations ──

    pub(crate) fn start(&mut self) -> Result<()> {
        self.protocol.start()
    }

    pub(crate) fn stop(&mut self) -> Result<()> {
        let result = self.protocol.stop();
        self.isolate("stop", result, ())
    }

    pub(crate) fn send(&mut self, message: Message, next: &mut dyn Sender) -> Result<()> {
        self.require(self.bindings.sender, Direction::Sender)?;
        let result = self.protocol.do_send(message, next);
        self.isolate("send", result, ())
    }

    pub(crate) fn receive(&mut self, message: Message, next: &mut dyn Receiver) -> Result<()> {
        self.require(self.bindings.receiver, Direction::Receiver)?;
        let result = self.protocol.do_receive(message, next);
        self.isolate("receive", result, ())
    }

    pub(crate) fn on_timer(
        &mut self,
        now: Duration,
        down: &mut dyn Sender,
        up: &mut dyn Receiver,
    ) -> Result<()> {
        let result = self.protocol.on_timer(now, down, up);
        self.isolate("timer", result, ())
    }

    pub(crate) fn register(&mut self, destination: &Address) {
        self.registrations.insert(
            destination.clone(),
            Registration {
                ready: true,
                has_pending: false,
            },
        );
        self.protocol.on_register(destination);
    }

    pub(crate) fn unregister(&mut self, destination: &Address) {
        self.registrations.remove(destination);
        self.protocol.on_unregister(destination);
    }

    /// Pull-path send through this node; `lower` is the chain below.
    pub(crate) fn send_to(&mut self, lower: &mut dyn Sink, message: Message) -> Result<bool> {
        self.require(self.bindings.pullable_sender, Direction::PullableSender)?;
        let destination = lower.destination().clone();
        let result = self.protocol.do_send_to(lower, message);
        // A faulted message counts as consumed.
        let accepted = self.isolate("send_to", result, true)?;
        if !accepted {
            self.registration_mut(&destination).has_pending = true;
            lower.set_ready(true);
        }
        Ok(accepted)
    }

    pub(crate) fn set_ready(&mut self, lower: &mut dyn Sink, ready: bool) {
        let reg = self.registration_mut(lower.destination());
        reg.ready = ready;
        let wanted = ready || reg.has_pending;
        lower.set_ready(wanted);
    }

    /// Resume this node's parked send. `Ok(true)` when the node is clear.
    pub(crate) fn send_pending(&mut self, lower: &mut dyn Sink) -> Result<bool> {
        let destination = lower.destination().clone();
        if !self.registration_mut(&destination).has_pending {
            return Ok(true);
        }
        let result = self.protocol.do_send_pending(lower);
        let done = self.isolate("send_pending", result, true)?;
        if done {
            self.registration_mut(&destination).has_pending = false;
        }
        Ok(done)
    }

    pub(crate) fn is_ready(&self, destination: &Address) -> bool {
        self.registrations.get(destination).is_some_and(|r| r.ready)
    }
}

fn bind(slot: &mut Binding, binding: Binding, protocol: String, direction: Direction) -> Result<()> {
    if *slot != Binding::Unbound {
        return Err(TransportError::AlreadyBound {
            protocol,
            direction,
        });
    }
    *slot = binding;
    Ok(())
}

/// Wire `nodes` as one linear chain. Ends that have nothing beyond them
/// are bound to the terminal.
pub(crate) fn wire(nodes: &mut [ProtocolNode], has_bottom: bool, has_top: bool) -> Result<()> {
    let n = nodes.len();
    for (i, node) in nodes.iter_mut().enumerate() {
        let down = if i + 1 < n || has_bottom {
            Binding::Linked
        } else {
            Binding::Terminal
        };
        let up = if i > 0 || has_top {
            Binding::Linked
        } else {
            Binding::Terminal
        };
        node.set_sender(down)?;
        node.set_pullable_sender(down)?;
        node.set_receiver(up)?;
    }
    Ok(())
}

// ── Chains ───────────────────────────────────────────────────────────────────

/// The nodes below some point plus whatever sits under them, as a Sender.
pub(crate) struct DownChain<'a> {
    pub nodes: &'a mut [ProtocolNode],
    pub bottom: &'a mut dyn Sender,
}

impl Sender for DownChain<'_> {
    fn send(&mut self, message: Message) -> Result<()> {
        match self.nodes.split_first_mut() {
            None => self.bottom.send(message),
            Some((node, rest)) => {
                let mut next = DownChain {
                    nodes: rest,
                    bottom: &mut *self.bottom,
                };
                node.send(message, &mut next)
            }
        }
    }
}

/// The nodes above some point plus whatever sits over them, as a Receiver.
pub(crate) struct UpChain<'a> {
    pub nodes: &'a mut [ProtocolNode],
    pub top: &'a mut dyn Receiver,
}

impl Receiver for UpChain<'_> {
    fn receive(&mut self, message: Message) -> Result<()> {
        match self.nodes.split_last_mut() {
            None => self.top.receive(message),
            Some((node, rest)) => {
                let mut next = UpChain {
                    nodes: rest,
                    top: &mut *self.top,
                };
                node.receive(message, &mut next)
            }
        }
    }
}

/// The nodes below some point plus the sink under them, as a Sink.
pub(crate) struct ChainSink<'a> {
    pub nodes: &'a mut [ProtocolNode],
    pub bottom: &'a mut dyn Sink,
}

impl Sink for ChainSink<'_> {
    fn destination(&self) -> &Address {
        self.bottom.destination()
    }

    fn send(&mut self, message: Message) -> Result<bool> {
        match self.nodes.split_first_mut() {
            None => self.bottom.send(message),
            Some((node, rest)) => {
                let mut lower = ChainSink {
                    nodes: rest,
                    bottom: &mut *self.bottom,
                };
                node.send_to(&mut lower, message)
            }
        }
    }

    fn set_ready(&mut self, ready: bool) {
        match self.nodes.split_first_mut() {
            None => self.bottom.set_ready(ready),
            Some((node, rest)) => {
                let mut lower = ChainSink {
                    nodes: rest,
                    bottom: &mut *self.bottom,
                };
                node.set_ready(&mut lower, ready);
            }
        }
    }
}

/// Timer pass over a chain: each node sees the chain below and above it.
pub(crate) fn timer_chain(
    nodes: &mut [ProtocolNode],
    now: Duration,
    bottom: &mut dyn Sender,
    top: &mut dyn Receiver,
) -> Result<()> {
    for i in 0..nodes.len() {
        let (above, rest) = nodes.split_at_mut(i);
        let Some((node, below)) = rest.split_first_mut() else {
            break;
        };
        let mut down = DownChain {
            nodes: below,
            bottom: &mut *bottom,
        };
        let mut up = UpChain {
            nodes: above,
            top: &mut *top,
        };
        node.on_timer(now, &mut down, &mut up)?;
    }
    Ok(())
}

/// Resume parked sends bottom-up. `Ok(true)` once every node is clear;
/// stops at the first node that is still pending.
pub(crate) fn drain_pending(nodes: &mut [ProtocolNode], lower: &mut dyn Sink) -> Result<bool> {
    let Some((node, above)) = nodes.split_last_mut() else {
        return Ok(true);
    };
    if !node.send_pending(lower)? {
        return Ok(false);
    }
    let mut sink = ChainSink {
        nodes: std::slice::from_mut(node),
        bottom: lower,
    };
    drain_pending(above, &mut sink)
}

/// Full pull: resume pending sends bottom-up, then, if every stage is
/// clear and the feed is ready, let the feed hand over one message.
pub(crate) fn pull_chain(
    nodes: &mut [ProtocolNode],
    lower: &mut dyn Sink,
    feed: &mut dyn Feed,
) -> Result<()> {
    let Some((node, above)) = nodes.split_last_mut() else {
        return match feed.feed(lower) {
            Err(e) if !e.is_interrupted() => {
                tracing::warn!(destination = %lower.destination(), error = %e, "feed failed");
                Ok(())
            }
            other => other,
        };
    };
    if !node.send_pending(lower)? {
        return Ok(());
    }
    if !node.is_ready(lower.destination()) {
        lower.set_ready(false);
        return Ok(());
    }
    let mut sink = ChainSink {
        nodes: std::slice::from_mut(node),
        bottom: lower,
    };
    pull_chain(above, &mut sink, feed)
}
