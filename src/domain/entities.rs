//! Domain Entities
//!
//! Namespace definitions, replication state and snapshots exchanged between
//! the storage engine, the replication core and remote nodes.

use crate::domain::value_objects::{ExtendedLsn, Lsn, ServerId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Index definition carried by index records and namespace definitions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub json_paths: Vec<String>,
    pub index_type: String,
    pub field_type: String,
    pub is_pk: bool,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, index_type: &str, field_type: &str) -> Self {
        let name = name.into();
        Self {
            json_paths: vec![name.clone()],
            name,
            index_type: index_type.to_string(),
            field_type: field_type.to_string(),
            is_pk: false,
        }
    }

    pub fn pk(mut self) -> Self {
        self.is_pk = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemModifyMode {
    Insert,
    Update,
    Upsert,
    Delete,
}

/// Namespace definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NamespaceDef {
    pub name: String,
    pub storage_enabled: bool,
    pub is_temporary: bool,
    pub indexes: Vec<IndexDef>,
}

impl NamespaceDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage_enabled: true,
            is_temporary: false,
            indexes: Vec::new(),
        }
    }

    /// System namespaces are prefixed with `#`.
    pub fn is_system(&self) -> bool {
        self.name.starts_with('#')
    }
}

/// Snapshot of a namespace tags matcher.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagsMatcher {
    pub version: i32,
    pub state_token: i32,
    pub tags: Vec<String>,
}

/// Replication role a namespace (or a whole database) plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClusterRole {
    #[default]
    None,
    /// Follower of an asynchronous replication leader.
    SimpleReplica,
    /// Follower inside a synchronous cluster.
    ClusterReplica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterizationStatus {
    pub leader_id: ServerId,
    pub role: ClusterRole,
}

impl ClusterizationStatus {
    pub fn simple_replica(leader_id: ServerId) -> Self {
        Self {
            leader_id,
            role: ClusterRole::SimpleReplica,
        }
    }

    pub fn cluster_replica(leader_id: ServerId) -> Self {
        Self {
            leader_id,
            role: ClusterRole::ClusterReplica,
        }
    }
}

/// Replication state reported for a namespace, or for the whole database
/// when no namespace name is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationState {
    pub ns_version: Lsn,
    pub last_lsn: Lsn,
    pub data_hash: u64,
    pub cluster_status: ClusterizationStatus,
}

impl ReplicationState {
    pub fn extended_lsn(&self) -> ExtendedLsn {
        ExtendedLsn::new(self.ns_version, self.last_lsn)
    }
}

/// One opaque unit of a snapshot transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    pub payload: Bytes,
    /// Chunk carries full namespace data rather than log records.
    pub raw: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub chunks: Vec<SnapshotChunk>,
    pub ns_version: Lsn,
    pub last_lsn: Lsn,
    pub expected_data_hash: u64,
    pub has_raw_data: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOpts {
    /// Watermark the follower already holds; empty requests a full snapshot.
    pub from: ExtendedLsn,
    pub max_wal_depth: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnumNamespacesOpts {
    pub only_names: bool,
    pub hide_system: bool,
    pub hide_temporary: bool,
}

impl EnumNamespacesOpts {
    pub fn only_names(mut self) -> Self {
        self.only_names = true;
        self
    }

    pub fn hide_system(mut self) -> Self {
        self.hide_system = true;
        self
    }

    pub fn hide_temporary(mut self) -> Self {
        self.hide_temporary = true;
        self
    }

    pub fn matches(&self, def: &NamespaceDef) -> bool {
        !(self.hide_system && def.is_system()) && !(self.hide_temporary && def.is_temporary)
    }
}

/// Options passed along with a replicated namespace creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NsReplicationOpts {
    pub state_token: Option<i32>,
    pub ns_version: Lsn,
}

/// Sync cluster configuration reported by a remote node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteClusterStats {
    /// Namespaces owned by the sync cluster; empty means every namespace.
    pub namespaces: Vec<String>,
}
