//! Plain message exchange: push path, pull path, compression and routing.

use crate::*;

use bytes::Bytes;
use junction_core::{MessageFlags, ReceivedStream, StreamPayload};
use junction_protocols::{MessageRouter, PeerPolicy, QueueFeed, RouteId, COMPRESSION_PROTOCOL};

#[test]
fn note_crosses_streaming_and_compression() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;

    a.send(note(&a.address, &b.address, 1, "hello"))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    let arrived = &b.inbox.messages()[0];
    assert_eq!(arrived.source(), &a.address);
    assert_eq!(
        note_of(arrived, &cluster.registry)?,
        Note {
            seq: 1,
            text: "hello".into()
        }
    );
    // The compression marker is internal to the pipeline.
    assert!(!arrived.has_flags(MessageFlags::NO_COMPRESS));
    assert_eq!(a.wire.frames(), 1);
    Ok(())
}

#[test]
fn repetitive_note_shrinks_on_the_wire() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;
    let text = "all work and no play ".repeat(500);

    a.send(note(&a.address, &b.address, 7, &text))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    assert!(a.wire.bytes() < text.len() / 4, "sent {} bytes", a.wire.bytes());
    assert_eq!(note_of(&b.inbox.messages()[0], &cluster.registry)?.text, text);
    Ok(())
}

#[test]
fn no_compress_flag_is_honoured_end_to_end() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;
    let text = "x".repeat(4096);

    a.send(note(&a.address, &b.address, 1, &text).with_flags(MessageFlags::NO_COMPRESS))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    assert!(a.wire.bytes() > text.len());
    let arrived = &b.inbox.messages()[0];
    assert!(arrived.has_flags(MessageFlags::NO_COMPRESS));
    assert_eq!(note_of(arrived, &cluster.registry)?.text, text);
    Ok(())
}

#[test]
fn pulled_notes_arrive_in_order() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;

    let feed = QueueFeed::new();
    for seq in 0..20 {
        feed.push(note(&a.address, &b.address, seq, "queued"));
    }
    let peer = b.address.clone();
    let registered = feed.clone();
    a.query(move |stack| {
        stack.register(peer, registered);
        Ok(())
    })?;

    assert!(wait_for(WAIT, || b.inbox.len() == 20));
    let seqs: Vec<u32> = b
        .inbox
        .messages()
        .iter()
        .map(|m| note_of(m, &cluster.registry).map(|n| n.seq))
        .collect::<Result<_>>()?;
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    assert!(feed.is_empty());

    // A drained feed stops asking to be pulled; refilling re-arms it.
    let peer = b.address.clone();
    assert!(wait_for(WAIT, || !a
        .query({
            let peer = peer.clone();
            move |stack: &mut ProtocolStack| Ok(stack.wants_pull(&peer))
        })
        .unwrap_or(true)));
    feed.push(note(&a.address, &b.address, 20, "late"));
    a.query(move |stack| {
        stack.set_ready(&peer, true);
        Ok(())
    })?;
    assert!(wait_for(WAIT, || b.inbox.len() == 21));
    Ok(())
}

#[test]
fn unregistered_feed_is_no_longer_pulled() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;
    let peer = b.address.clone();

    let gone = a.query(move |stack| {
        stack.register(peer.clone(), QueueFeed::new());
        Ok(stack.unregister(&peer).is_some())
    })?;

    assert!(gone);
    let peer = b.address.clone();
    assert!(!a.query(move |stack| Ok(stack.wants_pull(&peer)))?);
    Ok(())
}

const ROUTER: &str = "router";

fn routed_node(cluster: &Cluster, name: &str, peer: &str) -> Result<Node> {
    let policy = PeerPolicy::new().with_peer(Address::new(peer), RouteId::new("bulk"));
    let config = JunctionConfig::default();
    let protocols: Vec<Box<dyn Protocol>> = vec![
        Box::new(MessageRouter::new(ROUTER, policy)),
        Box::new(CompressionProtocol::new(
            config.compression,
            cluster.registry.clone(),
        )),
    ];
    cluster.node_with(name, protocols, NodeOptions::default())
}

fn attach_bulk_route(node: &Node) -> Result<()> {
    node.query(|stack| {
        let router = stack
            .find_mut::<MessageRouter>(ROUTER)
            .ok_or_else(|| TransportError::fault(anyhow::anyhow!("router missing")))?;
        router.attach(
            RouteId::new("bulk"),
            vec![Box::new(StreamingProtocol::new(
                JunctionConfig::default().streaming,
            ))],
        )
    })
}

#[test]
fn route_attached_at_runtime_streams_its_peer_traffic() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = routed_node(&cluster, "a", "b")?;
    let b = routed_node(&cluster, "b", "a")?;
    attach_bulk_route(&a)?;
    attach_bulk_route(&b)?;

    let body = Bytes::from(vec![0xabu8; 200_000]);
    let payload = StreamPayload::from_buffers(vec![body.clone()]);
    a.send(Message::new(a.address.clone(), b.address.clone()).with_part(MessagePart::stream(payload)))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    // 200 000 bytes in 64 KiB fragments.
    assert_eq!(a.wire.frames(), 4);
    let arrived = &b.inbox.messages()[0];
    let Some(MessagePart::App(app)) = arrived.part() else {
        anyhow::bail!("expected a reassembled stream");
    };
    let stream = app.downcast_ref::<ReceivedStream>().context("not a stream")?;
    assert_eq!(stream.concat(), body.to_vec());
    assert!(!arrived.has_flags(MessageFlags::STREAMED));
    Ok(())
}

#[test]
fn unrouted_peers_bypass_the_child_chain() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = routed_node(&cluster, "a", "b")?;
    let c = cluster.node("c")?;
    attach_bulk_route(&a)?;

    let names = a.query(|stack| {
        let router = stack
            .find_mut::<MessageRouter>(ROUTER)
            .ok_or_else(|| TransportError::fault(anyhow::anyhow!("router missing")))?;
        Ok(router.routes().map(|id| id.to_string()).collect::<Vec<_>>())
    })?;
    assert_eq!(names, vec!["bulk".to_string()]);
    assert!(a
        .query(|stack| Ok(stack.node(COMPRESSION_PROTOCOL).is_some()))?);

    a.send(note(&a.address, &c.address, 3, "direct"))?;
    assert!(wait_for(WAIT, || c.inbox.len() == 1));
    assert_eq!(note_of(&c.inbox.messages()[0], &cluster.registry)?.seq, 3);
    Ok(())
}

#[test]
fn stalled_pull_under_compression_sends_one_frame() -> Result<()> {
    let cluster = Cluster::new()?;
    let config = JunctionConfig::default();
    let a = cluster.node_with(
        "a",
        cluster.standard_protocols(&config),
        NodeOptions {
            stall_every: Some(1),
            ..NodeOptions::default()
        },
    )?;
    let b = cluster.node("b")?;
    let text = "backpressure ".repeat(400);

    let feed = QueueFeed::new();
    feed.push(note(&a.address, &b.address, 1, &text));
    let peer = b.address.clone();
    let registered = feed.clone();
    a.query(move |stack| {
        stack.register(peer, registered);
        Ok(())
    })?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    assert!(a.wire.stalls() >= 1);
    assert_eq!(a.wire.frames(), 1);
    assert!(a.wire.bytes() < text.len() / 4, "sent {} bytes", a.wire.bytes());
    assert_eq!(note_of(&b.inbox.messages()[0], &cluster.registry)?.text, text);

    // Later pulls resume the stalled slot without sending the note again.
    let peer = b.address.clone();
    assert!(wait_for(WAIT, || !a
        .query({
            let peer = peer.clone();
            move |stack: &mut ProtocolStack| Ok(stack.wants_pull(&peer))
        })
        .unwrap_or(true)));
    assert_eq!(a.wire.frames(), 1);

    feed.push(note(&a.address, &b.address, 2, "next"));
    a.query(move |stack| {
        stack.set_ready(&peer, true);
        Ok(())
    })?;
    assert!(wait_for(WAIT, || b.inbox.len() == 2));
    assert_eq!(a.wire.frames(), 2);
    assert_eq!(note_of(&b.inbox.messages()[1], &cluster.registry)?.seq, 2);
    Ok(())
}
