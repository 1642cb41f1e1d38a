//! Streamed payloads between compartments: fragmentation, pull-driven
//! backpressure, abandonment and config-driven fragment sizes.

use crate::*;

use bytes::Bytes;
use junction_core::config::StreamingConfig;
use junction_core::services::{LiveNodeCleanupManager, LiveNodeSet};
use junction_core::{MessageFlags, ReceivedStream, StreamPayload, StreamingPart};
use junction_protocols::{QueueFeed, STREAMING_PROTOCOL};

fn pattern(len: usize, seed: u8) -> Bytes {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn stream_message(from: &Address, to: &Address, sub_streams: &[Bytes]) -> Message {
    let payload = StreamPayload::from_buffers(sub_streams.to_vec());
    Message::new(from.clone(), to.clone()).with_part(MessagePart::stream(payload))
}

fn received(message: &Message) -> Result<ReceivedStream> {
    let Some(MessagePart::App(app)) = message.part() else {
        anyhow::bail!("expected a reassembled stream");
    };
    app.downcast_ref::<ReceivedStream>()
        .cloned()
        .context("not a stream")
}

#[test]
fn megabyte_in_three_sub_streams_is_reassembled() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;
    let sub_streams = [
        pattern(400_000, 1),
        pattern(350_000, 2),
        pattern(298_576, 3),
    ];

    a.send(stream_message(&a.address, &b.address, &sub_streams))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    // ceil(len / 64 KiB) fragments per sub-stream: 7 + 6 + 5.
    assert_eq!(a.wire.frames(), 18);
    let stream = received(&b.inbox.messages()[0])?;
    assert_eq!(stream.sub_streams, sub_streams.to_vec());
    assert_eq!(stream.total_len(), 1_048_576);

    let partial = b.query(|stack| {
        Ok(stack
            .find_mut::<StreamingProtocol>(STREAMING_PROTOCOL)
            .map(|s| s.partial_receives()))
    })?;
    assert_eq!(partial, Some(0));
    Ok(())
}

#[test]
fn empty_payload_is_sent_as_a_plain_message() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;

    a.send(stream_message(&a.address, &b.address, &[]))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    assert_eq!(a.wire.frames(), 1);
    assert_eq!(b.inbox.messages()[0].part_count(), 0);
    Ok(())
}

#[test]
fn pulled_stream_survives_a_stalling_transport() -> Result<()> {
    let cluster = Cluster::new()?;
    let config = JunctionConfig::default();
    let a = cluster.node_with(
        "a",
        cluster.standard_protocols(&config),
        NodeOptions {
            stall_every: Some(3),
            ..NodeOptions::default()
        },
    )?;
    let b = cluster.node("b")?;
    let sub_streams = [pattern(300_000, 9), Bytes::new(), pattern(70_000, 4)];

    let feed = QueueFeed::new();
    feed.push(stream_message(&a.address, &b.address, &sub_streams));
    feed.push(note(&a.address, &b.address, 1, "after the stream"));
    let peer = b.address.clone();
    a.query(move |stack| {
        stack.register(peer, feed);
        Ok(())
    })?;

    assert!(wait_for(WAIT, || b.inbox.len() == 2));
    assert!(a.wire.stalls() > 0);
    // 5 + 1 + 2 fragments, then the note.
    assert_eq!(a.wire.frames(), 9);
    let messages = b.inbox.messages();
    assert_eq!(received(&messages[0])?.sub_streams, sub_streams.to_vec());
    assert_eq!(note_of(&messages[1], &cluster.registry)?.seq, 1);

    let parked = a.query(|stack| {
        Ok(stack
            .find_mut::<StreamingProtocol>(STREAMING_PROTOCOL)
            .map(|s| s.parked_sends()))
    })?;
    assert_eq!(parked, Some(0));
    Ok(())
}

#[test]
fn files_stream_straight_from_disk() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("junction-files-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let bodies = [pattern(150_000, 7), pattern(20, 8)];
    let mut files = Vec::new();
    for (i, body) in bodies.iter().enumerate() {
        let path = dir.join(format!("part-{i}.bin"));
        std::fs::write(&path, body)?;
        files.push(std::fs::File::open(&path)?);
    }

    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;
    let payload = StreamPayload::from_readers(files);
    a.send(Message::new(a.address.clone(), b.address.clone()).with_part(MessagePart::stream(payload)))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    // 3 fragments for the first file, 1 for the second.
    assert_eq!(a.wire.frames(), 4);
    assert_eq!(received(&b.inbox.messages()[0])?.sub_streams, bodies.to_vec());
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn partial_stream_from_a_departed_peer_is_evicted() -> Result<()> {
    let cluster = Cluster::new()?;
    let live = LiveNodeSet::new();
    let ghost = Address::new("ghost");
    live.join(ghost.clone());

    let config = JunctionConfig::default();
    let streaming = StreamingProtocol::new(StreamingConfig {
        cleanup_period_ms: 10,
        ..config.streaming.clone()
    })
    .with_cleanup_manager(LiveNodeCleanupManager::new(live.clone()));
    let protocols: Vec<Box<dyn Protocol>> = vec![
        Box::new(streaming),
        Box::new(CompressionProtocol::new(
            config.compression.clone(),
            cluster.registry.clone(),
        )),
    ];
    let b = cluster.node_with("b", protocols, NodeOptions::default())?;

    // The first fragment of a two-fragment stream; the rest never comes.
    let fragment = StreamingPart::new(42, 0, 1, true, false, Some(pattern(1000, 0)));
    let orphan = Message::new(ghost.clone(), b.address.clone())
        .set_flags(MessageFlags::STREAMED | MessageFlags::NO_COMPRESS)
        .with_part(MessagePart::Streaming(fragment));
    b.query(move |stack| stack.receive(orphan))?;

    let partial = |node: &Node| {
        node.query(|stack| {
            Ok(stack
                .find_mut::<StreamingProtocol>(STREAMING_PROTOCOL)
                .map_or(0, |s| s.partial_receives()))
        })
        .unwrap_or(usize::MAX)
    };
    // A live peer's partial stream survives cleanup rounds.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(partial(&b), 1);

    live.leave(&ghost);
    assert!(wait_for(WAIT, || partial(&b) == 0));
    assert_eq!(b.inbox.len(), 0);
    Ok(())
}

#[test]
fn config_file_and_overrides_set_the_fragment_size() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("junction-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        "[compartment]\n\
         dispatch_period_ms = 2\n\
         timer_period_ms = 5\n\
         \n\
         [streaming]\n\
         max_fragment_size = 1000\n",
    )?;

    let mut config = JunctionConfig::load_file(&path)?;
    assert_eq!(config.streaming.max_fragment_size, 1000);
    config.apply_overrides(overrides(&[
        ("JUNCTION_STREAMING__MAX_FRAGMENT_SIZE", "4096"),
        ("JUNCTION_COMPRESSION__LEVEL", "not a number"),
    ]));
    config.validate()?;
    assert_eq!(config.streaming.max_fragment_size, 4096);
    assert_eq!(config.compression.level, 3);
    std::fs::remove_dir_all(&dir)?;

    let cluster = Cluster::new()?;
    let a = cluster.node_with(
        "a",
        cluster.standard_protocols(&config),
        NodeOptions {
            config: Some(config.clone()),
            ..NodeOptions::default()
        },
    )?;
    let b = cluster.node("b")?;
    let body = pattern(10_000, 5);

    a.send(stream_message(&a.address, &b.address, &[body.clone()]))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    assert_eq!(a.wire.frames(), 3);
    assert_eq!(received(&b.inbox.messages()[0])?.concat(), body.to_vec());
    Ok(())
}

#[test]
fn invalid_config_is_rejected() -> Result<()> {
    let mut config = JunctionConfig::default();
    config.apply_overrides(overrides(&[("JUNCTION_STREAMING__MAX_FRAGMENT_SIZE", "0")]));
    assert!(config.validate().is_err());
    Ok(())
}
