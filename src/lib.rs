//! docdb-replication Library
//!
//! Leader-to-follower replication core of an embeddable document database:
//! the shared updates queue, namespace synchronization, the per-node
//! replication threads and the async/cluster drivers that own them.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use config::load_config;
pub use domain::errors::{ReplError, Result};
pub use domain::ports::{ClientFactory, ReplicationClient, StorageEngine};
pub use domain::value_objects::{ExtendedLsn, Lsn, ServerId};
pub use infrastructure::Terminator;
pub use replication::{
    AsyncDataReplicator, AsyncReplConfig, ClusterConfig, ClusterReplThread, ReplThread,
    ReplThreadConfig, UpdatesQueue,
};
