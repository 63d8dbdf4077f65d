//! Value Objects - Immutable replication primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are `Copy` and can be freely shared between tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a database server taking part in replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub i32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a follower node inside the replication config.
pub type NodeUid = u32;

/// Log sequence number.
///
/// Stamps a write with the server that originated it and a per-namespace
/// monotonic counter. A zero counter means "no write yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lsn {
    pub server: ServerId,
    pub counter: i64,
}

impl Lsn {
    pub const fn new(server: ServerId, counter: i64) -> Self {
        Self { server, counter }
    }

    pub fn is_empty(&self) -> bool {
        self.counter == 0
    }

    /// Same counter, stamped by another server.
    pub fn with_server(self, server: ServerId) -> Self {
        Self { server, ..self }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server, self.counter)
    }
}

/// Replication watermark: namespace version plus the LSN inside it.
///
/// Two values are only comparable when their namespace versions match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtendedLsn {
    pub ns_version: Lsn,
    pub lsn: Lsn,
}

impl ExtendedLsn {
    pub const fn new(ns_version: Lsn, lsn: Lsn) -> Self {
        Self { ns_version, lsn }
    }

    pub fn is_empty(&self) -> bool {
        self.ns_version.is_empty() && self.lsn.is_empty()
    }

    pub fn is_compatible_by_ns_version(&self, other: &ExtendedLsn) -> bool {
        self.ns_version == other.ns_version
    }

    pub fn has_newer_counter_than(&self, other: &ExtendedLsn) -> bool {
        self.lsn.counter > other.lsn.counter
    }
}

impl fmt::Display for ExtendedLsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ns_version: {}, lsn: {} }}", self.ns_version, self.lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_lsn() {
        assert!(Lsn::default().is_empty());
        assert!(!Lsn::new(ServerId(1), 3).is_empty());
        assert!(ExtendedLsn::default().is_empty());
    }

    #[test]
    fn test_extended_lsn_with_version_only_is_not_empty() {
        let ext = ExtendedLsn::new(Lsn::new(ServerId(1), 2), Lsn::default());
        assert!(!ext.is_empty());
    }

    #[test]
    fn test_compatibility_by_version() {
        let a = ExtendedLsn::new(Lsn::new(ServerId(1), 3), Lsn::new(ServerId(1), 10));
        let b = ExtendedLsn::new(Lsn::new(ServerId(1), 3), Lsn::new(ServerId(1), 15));
        let c = ExtendedLsn::new(Lsn::new(ServerId(1), 4), Lsn::new(ServerId(1), 15));
        assert!(a.is_compatible_by_ns_version(&b));
        assert!(!a.is_compatible_by_ns_version(&c));
        assert!(b.has_newer_counter_than(&a));
        assert!(!a.has_newer_counter_than(&b));
        assert!(!b.has_newer_counter_than(&c));
    }

    #[test]
    fn test_with_server() {
        let lsn = Lsn::new(ServerId(1), 42).with_server(ServerId(7));
        assert_eq!(lsn.server, ServerId(7));
        assert_eq!(lsn.counter, 42);
        assert_eq!(lsn.to_string(), "7:42");
    }
}
