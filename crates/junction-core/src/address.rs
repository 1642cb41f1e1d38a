//! Node identity.
//!
//! An [`Address`] names a peer for the lifetime of a connection. The
//! transport layer resolves it to something dialable through a
//! [`ConnectionProvider`](crate::services::ConnectionProvider); the protocol
//! stack only compares and hashes it.

use std::fmt;
use std::sync::Arc;

/// Opaque, totally ordered node identity.
///
/// Cloning is a reference-count bump, so addresses can be copied freely into
/// stream tables and registrations.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(Arc<str>);

impl Address {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl From<&str> for Address {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Address {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_order_lexicographically() {
        let a = Address::new("node-a");
        let b = Address::new("node-b");
        assert!(a < b);
        assert_eq!(a, Address::from("node-a"));
    }

    #[test]
    fn display_is_the_bare_name() {
        assert_eq!(Address::new("10.0.0.1:9000").to_string(), "10.0.0.1:9000");
    }

    #[test]
    fn usable_as_map_key() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(Address::new("x"));
        set.insert(Address::from(String::from("x")));
        set.insert(Address::new("y"));
        assert_eq!(set.len(), 2);
    }
}
