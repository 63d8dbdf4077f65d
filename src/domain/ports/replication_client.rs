//! Replication Client Port
//!
//! Defines the session the leader keeps with every follower node.
//! Every mutating call carries the LSN the follower must stamp the write
//! with, so the follower records the original origin of the change.

use crate::domain::entities::{
    ClusterizationStatus, IndexDef, ItemModifyMode, NamespaceDef, NsReplicationOpts,
    RemoteClusterStats, ReplicationState, SnapshotChunk, TagsMatcher,
};
use crate::domain::errors::{ReplError, Result};
use crate::domain::value_objects::Lsn;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Callback fired by a client when its connection breaks.
pub type ConnectionObserver = Arc<dyn Fn(&ReplError) + Send + Sync>;

/// Handle returned when registering a [`ConnectionObserver`].
pub type ObserverId = u64;

/// Session settings handed to a [`ClientFactory`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub app_name: String,
    pub net_timeout: Duration,
    pub enable_compression: bool,
}

/// Wire client bound to one follower node.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Establish the session. Errors surface again on the next call.
    async fn connect(&self, dsn: &str) -> Result<()>;

    /// Close the session; in-flight and later calls fail with a network error.
    fn stop(&self);

    /// Liveness probe.
    async fn status(&self, timeout: Duration) -> Result<()>;

    /// Replication state of `ns`, or of the whole database when `None`.
    async fn get_repl_state(&self, ns: Option<&str>) -> Result<ReplicationState>;

    async fn set_clusterization_status(&self, ns: &str, status: ClusterizationStatus) -> Result<()>;

    /// Sync cluster configuration of the remote node, if it has one.
    async fn cluster_replication_stats(&self) -> Result<Option<RemoteClusterStats>>;

    /// Force the session to reload the namespace tags matcher.
    async fn refresh_tags_matcher(&self, ns: &str) -> Result<()>;

    async fn apply_snapshot_chunk(&self, ns: &str, chunk: &SnapshotChunk, lsn: Lsn) -> Result<()>;

    /// Create a temporary namespace based on `base` and return its name.
    async fn create_temporary_namespace(
        &self,
        base: &str,
        ns_version: Lsn,
        lsn: Lsn,
    ) -> Result<String>;

    async fn rename_namespace(&self, from: &str, to: &str, lsn: Lsn) -> Result<()>;

    async fn drop_namespace(&self, ns: &str, lsn: Lsn) -> Result<()>;

    async fn add_namespace(
        &self,
        def: &NamespaceDef,
        opts: NsReplicationOpts,
        lsn: Lsn,
    ) -> Result<()>;

    async fn truncate_namespace(&self, ns: &str, lsn: Lsn) -> Result<()>;

    async fn modify_item(
        &self,
        ns: &str,
        mode: ItemModifyMode,
        item: &Bytes,
        lsn: Lsn,
    ) -> Result<()>;

    async fn add_index(&self, ns: &str, index: &IndexDef, lsn: Lsn) -> Result<()>;

    async fn drop_index(&self, ns: &str, index: &IndexDef, lsn: Lsn) -> Result<()>;

    async fn update_index(&self, ns: &str, index: &IndexDef, lsn: Lsn) -> Result<()>;

    async fn put_meta(&self, ns: &str, key: &str, value: &str, lsn: Lsn) -> Result<()>;

    async fn set_schema(&self, ns: &str, schema: &str, lsn: Lsn) -> Result<()>;

    async fn set_tags_matcher(&self, ns: &str, tm: &TagsMatcher, lsn: Lsn) -> Result<()>;

    async fn update_query(&self, ns: &str, sql: &str, lsn: Lsn) -> Result<()>;

    async fn delete_query(&self, ns: &str, sql: &str, lsn: Lsn) -> Result<()>;

    async fn begin_transaction(&self, ns: &str, lsn: Lsn) -> Result<Box<dyn ClientTransaction>>;

    fn add_connection_observer(&self, observer: ConnectionObserver) -> ObserverId;

    fn remove_connection_observer(&self, id: ObserverId);
}

/// Open transaction on a follower namespace.
#[async_trait]
pub trait ClientTransaction: Send + Sync {
    async fn modify_item(&mut self, mode: ItemModifyMode, item: &Bytes, lsn: Lsn) -> Result<()>;

    async fn modify_query(&mut self, sql: &str, delete: bool, lsn: Lsn) -> Result<()>;

    async fn put_meta(&mut self, key: &str, value: &str, lsn: Lsn) -> Result<()>;

    async fn set_tags_matcher(&mut self, tm: &TagsMatcher, lsn: Lsn) -> Result<()>;

    async fn commit(self: Box<Self>, lsn: Lsn) -> Result<()>;

    async fn rollback(self: Box<Self>, lsn: Lsn) -> Result<()>;
}

/// Creates one client per follower node.
pub trait ClientFactory: Send + Sync {
    fn new_client(&self, dsn: &str, config: &ClientConfig) -> Arc<dyn ReplicationClient>;
}
