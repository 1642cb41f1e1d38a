//! Immutable messages with structurally shared part lists.
//!
//! A [`Message`] is never mutated after construction. Adding or removing a
//! part, or changing flags, returns a new `Message` whose part list shares
//! the unchanged tail with the original. An in-flight message can therefore
//! be read from one place while a later stage derives a modified copy.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;

use crate::address::Address;
use crate::part::MessagePart;

// ── Flags ────────────────────────────────────────────────────────────────────

bitflags! {
    /// Per-message delivery hints. Carried on the wire as a 32-bit integer;
    /// bits this build does not know survive a decode/encode cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        /// Never compress this message (already compressed, or a fragment).
        const NO_COMPRESS   = 1 << 0;
        /// Flush downstream immediately instead of batching.
        const NO_DELAY      = 1 << 1;
        const HIGH_PRIORITY = 1 << 2;
        const LOW_PRIORITY  = 1 << 3;
        /// Produced by the streaming stage.
        const STREAMED      = 1 << 4;
    }
}

// ── Part list ────────────────────────────────────────────────────────────────

struct PartNode {
    part: MessagePart,
    next: Option<Arc<PartNode>>,
    // Cached over the whole list starting at this node.
    len: usize,
    size: usize,
}

/// Iterator over parts, most-recent first.
pub struct Parts<'a> {
    node: Option<&'a PartNode>,
}

impl<'a> Iterator for Parts<'a> {
    type Item = &'a MessagePart;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node?;
        self.node = node.next.as_deref();
        Some(&node.part)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.node.map_or(0, |n| n.len);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Parts<'_> {}

// ── Message ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Message {
    source: Address,
    destination: Address,
    flags: MessageFlags,
    head: Option<Arc<PartNode>>,
    files: Arc<[PathBuf]>,
}

impl Message {
    pub fn new(source: Address, destination: Address) -> Self {
        Self {
            source,
            destination,
            flags: MessageFlags::empty(),
            head: None,
            files: Arc::from(Vec::new()),
        }
    }

    /// Rebuild a message from parts listed outermost (most recent) first.
    pub fn from_parts(
        source: Address,
        destination: Address,
        flags: MessageFlags,
        parts: impl IntoIterator<Item = MessagePart>,
    ) -> Self {
        let parts: Vec<MessagePart> = parts.into_iter().collect();
        let mut message = Self::new(source, destination).with_flags(flags);
        for part in parts.into_iter().rev() {
            message = message.with_part(part);
        }
        message
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn has_flags(&self, flags: MessageFlags) -> bool {
        self.flags.contains(flags)
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Outermost part.
    pub fn part(&self) -> Option<&MessagePart> {
        self.head.as_deref().map(|n| &n.part)
    }

    pub fn parts(&self) -> Parts<'_> {
        Parts {
            node: self.head.as_deref(),
        }
    }

    pub fn part_count(&self) -> usize {
        self.head.as_ref().map_or(0, |n| n.len)
    }

    /// Estimated size: the sum of all part sizes.
    pub fn size(&self) -> usize {
        self.head.as_ref().map_or(0, |n| n.size)
    }

    /// New message with `part` pushed on top.
    pub fn with_part(&self, part: MessagePart) -> Self {
        let (len, size) = self.head.as_ref().map_or((0, 0), |n| (n.len, n.size));
        let node = PartNode {
            size: size + part.size(),
            len: len + 1,
            part,
            next: self.head.clone(),
        };
        Self {
            head: Some(Arc::new(node)),
            ..self.clone()
        }
    }

    /// New message with the outermost part removed.
    pub fn without_part(&self) -> Self {
        Self {
            head: self.head.as_ref().and_then(|n| n.next.clone()),
            ..self.clone()
        }
    }

    /// New message with the outermost part swapped for `part`.
    pub fn replace_part(&self, part: MessagePart) -> Self {
        self.without_part().with_part(part)
    }

    /// New message with `flags` added.
    pub fn with_flags(&self, flags: MessageFlags) -> Self {
        Self {
            flags: self.flags | flags,
            ..self.clone()
        }
    }

    pub fn without_flags(&self, flags: MessageFlags) -> Self {
        Self {
            flags: self.flags - flags,
            ..self.clone()
        }
    }

    /// New message with all flags replaced.
    pub fn set_flags(&self, flags: MessageFlags) -> Self {
        Self {
            flags,
            ..self.clone()
        }
    }

    pub fn with_files(&self, files: Vec<PathBuf>) -> Self {
        Self {
            files: Arc::from(files),
            ..self.clone()
        }
    }

    /// Same payload, new endpoints.
    pub fn readdress(&self, source: Address, destination: Address) -> Self {
        Self {
            source,
            destination,
            ..self.clone()
        }
    }

    /// A fresh message with the same endpoints and flags but no parts.
    pub fn sibling(&self) -> Self {
        Self {
            head: None,
            files: Arc::from(Vec::new()),
            ..self.clone()
        }
    }

    /// True when both messages share the same outermost part node.
    pub fn shares_parts_with(&self, other: &Message) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("flags", &self.flags)
            .field("parts", &self.parts().collect::<Vec<_>>())
            .field("files", &self.files)
            .finish()
    }
}

// Iterative drop so a long part chain cannot overflow the stack.
impl Drop for PartNode {
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{SerializedPart, StreamingPart};
    use bytes::Bytes;

    fn msg() -> Message {
        Message::new(Address::new("a"), Address::new("b"))
    }

    fn raw(n: usize) -> MessagePart {
        MessagePart::Serialized(SerializedPart::new(16, Bytes::from(vec![0u8; n])))
    }

    #[test]
    fn size_is_sum_of_part_sizes() {
        let m = msg().with_part(raw(10)).with_part(raw(5));
        assert_eq!(m.part_count(), 2);
        assert_eq!(m.size(), 15);
        assert_eq!(m.size(), m.parts().map(MessagePart::size).sum::<usize>());
    }

    #[test]
    fn adding_a_part_leaves_the_original_untouched() {
        let base = msg().with_part(raw(3));
        let derived = base.with_part(raw(7));
        assert_eq!(base.part_count(), 1);
        assert_eq!(derived.part_count(), 2);
        assert!(derived.without_part().shares_parts_with(&base));
    }

    #[test]
    fn parts_iterate_most_recent_first() {
        let fragment = StreamingPart::new(1, 0, 1, true, true, None);
        let m = msg()
            .with_part(raw(1))
            .with_part(MessagePart::Streaming(fragment));
        let ids: Vec<u32> = m.parts().map(MessagePart::type_id).collect();
        assert_eq!(ids, vec![crate::part::STREAMING_PART_TYPE_ID, 16]);
    }

    #[test]
    fn from_parts_preserves_outermost_first_order() {
        let m = Message::from_parts(
            Address::new("a"),
            Address::new("b"),
            MessageFlags::NO_DELAY,
            vec![raw(2), raw(9)],
        );
        let sizes: Vec<usize> = m.parts().map(MessagePart::size).collect();
        assert_eq!(sizes, vec![2, 9]);
        assert!(m.has_flags(MessageFlags::NO_DELAY));
    }

    #[test]
    fn flag_changes_produce_new_messages() {
        let base = msg();
        let marked = base.with_flags(MessageFlags::NO_COMPRESS | MessageFlags::NO_DELAY);
        assert!(base.flags().is_empty());
        assert!(marked.has_flags(MessageFlags::NO_COMPRESS));
        let cleared = marked.without_flags(MessageFlags::NO_DELAY);
        assert_eq!(cleared.flags(), MessageFlags::NO_COMPRESS);
    }

    #[test]
    fn unknown_flag_bits_are_retained() {
        let flags = MessageFlags::from_bits_retain(0x8000_0001);
        assert!(flags.contains(MessageFlags::NO_COMPRESS));
        assert_eq!(flags.bits(), 0x8000_0001);
    }

    #[test]
    fn long_chains_drop_without_recursion() {
        let mut m = msg();
        for _ in 0..200_000 {
            m = m.with_part(raw(0));
        }
        assert_eq!(m.part_count(), 200_000);
        drop(m);
    }
}
