//! Content-based dispatch into child chains attached at runtime.
//!
//! A [`MessageRouter`] sits in a stack like any other stage. For each
//! message its [`RoutingPolicy`] names a route; a routed message runs through
//! that route's [`ProtocolSubStack`] and then continues to the router's own
//! neighbour. Unrouted messages pass straight through.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use junction_core::{Address, Direction, Message, Result, TransportError};

use crate::protocol::{Protocol, Receiver, Sender, Sink};
use crate::substack::ProtocolSubStack;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RouteId(Arc<str>);

impl RouteId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouteId({})", self.0)
    }
}

impl From<&str> for RouteId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Picks the route for one message. `direction` is `Receiver` for inbound
/// traffic and `Sender` or `PullableSender` for outbound.
pub trait RoutingPolicy: Send {
    fn route(&mut self, message: &Message, direction: Direction) -> Option<RouteId>;
}

impl<F> RoutingPolicy for F
where
    F: FnMut(&Message, Direction) -> Option<RouteId> + Send,
{
    fn route(&mut self, message: &Message, direction: Direction) -> Option<RouteId> {
        self(message, direction)
    }
}

/// Routes by peer: the destination of outbound traffic, the source of
/// inbound traffic.
#[derive(Debug, Clone, Default)]
pub struct PeerPolicy {
    peers: HashMap<Address, RouteId>,
}

impl PeerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, peer: Address, route: RouteId) -> Self {
        self.peers.insert(peer, route);
        self
    }
}

impl RoutingPolicy for PeerPolicy {
    fn route(&mut self, message: &Message, direction: Direction) -> Option<RouteId> {
        let peer = match direction {
            Direction::Receiver => message.source(),
            Direction::Sender | Direction::PullableSender => message.destination(),
        };
        self.peers.get(peer).cloned()
    }
}

pub struct MessageRouter {
    name: String,
    policy: Box<dyn RoutingPolicy>,
    // Attach order; also the timer order.
    routes: Vec<(RouteId, ProtocolSubStack)>,
    destinations: HashSet<Address>,
    // The route holding a parked pull-path send, per destination.
    pending: HashMap<Address, RouteId>,
    started: bool,
}

impl MessageRouter {
    pub fn new(name: impl Into<String>, policy: impl RoutingPolicy + 'static) -> Self {
        Self {
            name: name.into(),
            policy: Box::new(policy),
            routes: Vec::new(),
            destinations: HashSet::new(),
            pending: HashMap::new(),
            started: false,
        }
    }

    /// Attach a child chain under `id`. Protocols are listed top first.
    /// A router that is already running starts the child immediately and
    /// tells it about every destination registered so far.
    pub fn attach(&mut self, id: RouteId, protocols: Vec<Box<dyn Protocol>>) -> Result<()> {
        if self.routes.iter().any(|(existing, _)| *existing == id) {
            return Err(TransportError::AlreadyBound {
                protocol: format!("{}/{}", self.name, id),
                direction: Direction::Sender,
            });
        }
        let mut child = ProtocolSubStack::new(id.as_str(), protocols);
        if self.started {
            child.start()?;
        }
        for destination in &self.destinations {
            child.on_register(destination);
        }
        tracing::info!(router = %self.name, route = %id, protocols = child.len(), "route attached");
        self.routes.push((id, child));
        Ok(())
    }

    /// Detach and stop a child chain. A send parked inside it is abandoned.
    pub fn detach(&mut self, id: &RouteId) -> Option<ProtocolSubStack> {
        let index = self.routes.iter().position(|(existing, _)| existing == id)?;
        let (_, mut child) = self.routes.remove(index);
        self.pending.retain(|_, route| route != id);
        if self.started {
            if let Err(e) = child.stop() {
                tracing::warn!(router = %self.name, route = %id, error = %e, "route stop failed");
            }
        }
        tracing::info!(router = %self.name, route = %id, "route detached");
        Some(child)
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteId> {
        self.routes.iter().map(|(id, _)| id)
    }

    pub fn route_mut(&mut self, id: &RouteId) -> Option<&mut ProtocolSubStack> {
        self.routes
            .iter_mut()
            .find(|(existing, _)| existing == id)
            .map(|(_, child)| child)
    }

    fn select(&mut self, message: &Message, direction: Direction) -> Option<usize> {
        let id = self.policy.route(message, direction)?;
        let index = self.routes.iter().position(|(existing, _)| *existing == id);
        if index.is_none() {
            tracing::debug!(router = %self.name, route = %id, "no such route; passing through");
        }
        index
    }
}

impl Protocol for MessageRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        for (_, child) in &mut self.routes {
            child.start()?;
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        for (_, child) in &mut self.routes {
            child.stop()?;
        }
        self.pending.clear();
        self.started = false;
        Ok(())
    }

    fn on_timer(&mut self, now: Duration, down: &mut dyn Sender, up: &mut dyn Receiver) -> Result<()> {
        for (_, child) in &mut self.routes {
            child.on_timer(now, &mut *down, &mut *up)?;
        }
        Ok(())
    }

    fn do_send(&mut self, message: Message, next: &mut dyn Sender) -> Result<()> {
        match self.select(&message, Direction::Sender) {
            Some(index) => self.routes[index].1.do_send(message, next),
            None => next.send(message),
        }
    }

    fn do_receive(&mut self, message: Message, next: &mut dyn Receiver) -> Result<()> {
        match self.select(&message, Direction::Receiver) {
            Some(index) => self.routes[index].1.do_receive(message, next),
            None => next.receive(message),
        }
    }

    fn do_send_to(&mut self, sink: &mut dyn Sink, message: Message) -> Result<bool> {
        let Some(index) = self.select(&message, Direction::PullableSender) else {
            return sink.send(message);
        };
        let (id, child) = &mut self.routes[index];
        let accepted = child.do_send_to(sink, message)?;
        if !accepted {
            self.pending.insert(sink.destination().clone(), id.clone());
        }
        Ok(accepted)
    }

    fn do_send_pending(&mut self, sink: &mut dyn Sink) -> Result<bool> {
        let Some(id) = self.pending.remove(sink.destination()) else {
            return Ok(true);
        };
        let Some((_, child)) = self.routes.iter_mut().find(|(existing, _)| *existing == id) else {
            return Ok(true);
        };
        let done = child.do_send_pending(sink)?;
        if !done {
            self.pending.insert(sink.destination().clone(), id);
        }
        Ok(done)
    }

    fn on_register(&mut self, destination: &Address) {
        self.destinations.insert(destination.clone());
        for (_, child) in &mut self.routes {
            child.on_register(destination);
        }
    }

    fn on_unregister(&mut self, destination: &Address) {
        self.destinations.remove(destination);
        self.pending.remove(destination);
        for (_, child) in &mut self.routes {
            child.on_unregister(destination);
        }
    }
}
