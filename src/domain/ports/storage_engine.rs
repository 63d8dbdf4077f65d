//! Storage Engine Port
//!
//! The leader's local engine as seen by the replication core.

use crate::domain::entities::{
    EnumNamespacesOpts, NamespaceDef, ReplicationState, Snapshot, SnapshotOpts,
};
use crate::domain::errors::Result;
use async_trait::async_trait;

/// Read-only view of the local storage engine.
///
/// The replication core never mutates leader data: it enumerates
/// namespaces, reads their replication state and asks for snapshots
/// bounded by the follower's watermark.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// List local namespaces.
    async fn enum_namespaces(&self, opts: EnumNamespacesOpts) -> Result<Vec<NamespaceDef>>;

    /// Replication state of a namespace. `NamespaceNotFound` when absent.
    async fn get_repl_state(&self, ns: &str) -> Result<ReplicationState>;

    /// Snapshot starting after `opts.from`, or a full one when it is empty
    /// or no longer reachable through the log.
    async fn get_snapshot(&self, ns: &str, opts: SnapshotOpts) -> Result<Snapshot>;
}
