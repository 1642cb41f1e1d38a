//! Compartment lifecycle around a live stack: long tasks, fault isolation
//! and shutdown.

use crate::*;

use bytes::Bytes;
use junction_core::{CompressionPart, MessageFlags};
use junction_engine::LongTask;

#[test]
fn long_task_result_is_sent_from_the_reactor() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;
    let (from, to) = (a.address.clone(), b.address.clone());

    let task = LongTask::new(move || {
        // Stands in for work that must not block the reactor.
        std::thread::sleep(Duration::from_millis(20));
        Ok(note(&from, &to, 99, "computed"))
    })
    .on_success(
        |stack: &mut ProtocolStack, _: &CompartmentHandle<ProtocolStack>, message: Message| {
            if let Err(e) = stack.send(message) {
                tracing::warn!(error = %e, "send failed");
            }
        },
    );
    assert!(a.compartment.execute(task));

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    assert_eq!(note_of(&b.inbox.messages()[0], &cluster.registry)?.seq, 99);
    Ok(())
}

#[test]
fn corrupt_frame_does_not_stop_the_peer() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;

    // Marked as already compressed, so it crosses the wire untouched and
    // fails to decompress on arrival.
    let bogus = Message::new(a.address.clone(), b.address.clone())
        .set_flags(MessageFlags::NO_COMPRESS)
        .with_part(MessagePart::Compression(CompressionPart::new(
            64,
            Bytes::from_static(b"definitely not zstd"),
        )));
    a.send(bogus)?;
    a.send(note(&a.address, &b.address, 2, "still alive"))?;

    assert!(wait_for(WAIT, || b.inbox.len() == 1));
    assert_eq!(note_of(&b.inbox.messages()[0], &cluster.registry)?.seq, 2);
    assert!(!b.compartment.is_stopped());
    Ok(())
}

#[test]
fn stopped_compartment_hands_back_its_stack() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;
    let b = cluster.node("b")?;

    a.send(note(&a.address, &b.address, 1, "before"))?;
    assert!(wait_for(WAIT, || b.inbox.len() == 1));

    let Node {
        compartment, inbox, ..
    } = b;
    let handle = compartment.handle().clone();
    assert!(handle.stats().executed >= 1);
    let mut stack = compartment.stop()?;
    assert!(stack.is_started());
    assert_eq!(stack.protocol_names(), vec!["streaming", "compression"]);
    stack.stop()?;
    assert!(!stack.is_started());

    assert!(handle.is_stopped());
    assert!(!handle.submit(|_: &mut ProtocolStack, _: &CompartmentHandle<ProtocolStack>| Ok(())));

    // The sender's fault is isolated at its stack; nothing arrives.
    a.send(note(&a.address, &Address::new("b"), 2, "after"))?;
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(inbox.len(), 1);
    Ok(())
}

#[test]
fn unknown_destination_is_an_isolated_fault() -> Result<()> {
    let cluster = Cluster::new()?;
    let a = cluster.node("a")?;

    a.send(note(&a.address, &Address::new("nowhere"), 1, "lost"))?;

    assert_eq!(a.wire.frames(), 0);
    assert!(cluster.provider.resolve(&Address::new("nowhere")).is_none());
    assert!(!a.compartment.is_stopped());
    Ok(())
}
