//! Replication Core
//!
//! Propagates writes from a leader's storage engine to follower nodes.
//!
//! ## Architecture
//!
//! - **Queue**: the storage engine pushes update records into a shared,
//!   bounded [`UpdatesQueue`]; every record carries quorum counters
//! - **Threads**: each [`ReplThread`] owns one OS thread and one routine per
//!   follower node
//! - **Sync**: before streaming, every namespace is brought up to date by
//!   WAL replay or by a forced snapshot through a temporary namespace
//! - **Policies**: [`AsyncThreadParam`] and [`ClusterThreadParam`] select
//!   async or synchronous cluster behavior
//! - **Drivers**: [`AsyncDataReplicator`] and [`ClusterReplThread`] start,
//!   stop and steer the threads
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docdb_replication::replication::{AsyncDataReplicator, AsyncNodeConfig, AsyncReplConfig};
//!
//! let replicator = AsyncDataReplicator::new(server_id, storage, queue, factory);
//! replicator.configure(AsyncReplConfig::leader(vec![
//!     AsyncNodeConfig::new(ServerId(2), "cproto://follower:6534/db"),
//! ]))?;
//! replicator.run()?;
//! ```

mod apply;
mod async_replicator;
mod batcher;
mod behavior;
mod cluster_thread;
mod config;
mod node;
mod queue;
mod stats;
mod sync;
mod thread;
mod types;

pub use apply::{apply_stateless, apply_update};
pub use async_replicator::{AsyncDataReplicator, DEFAULT_THREADS_COUNT};
pub use batcher::UpdatesBatcher;
pub use behavior::{
    AsyncThreadParam, BehaviorPolicy, ClusterThreadParam, NamespaceFilter, PermissionGate,
    RaftRole, ReplMode, SharedSyncState, SynchronizationList,
};
pub use cluster_thread::{consensus_for, ClusterReplThread};
pub use config::{
    AsyncNodeConfig, AsyncReplConfig, AsyncReplMode, AsyncReplRole, ClusterConfig,
    ClusterNodeConfig, ConfigError, NodeConfig, ReplThreadConfig,
};
pub use node::{NamespaceData, Node};
pub use queue::{
    PushHandle, ReaderKey, ReplicationResult, UpdateBlock, UpdateCounters, UpdatesQueue,
};
pub use stats::{
    NodeStats, NodeStatus, ReplicationStats, ReplicationStatsCollector, SyncKind, SyncState,
    SyncTimes,
};
pub use sync::NamespaceSyncer;
pub use thread::ReplThread;
pub use types::{Applied, ApplyResult, RecordKind, ResyncKind, UpdateRecord};
