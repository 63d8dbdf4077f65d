//! Behavior policies
//!
//! A replication thread is generic over a [`BehaviorPolicy`] that answers
//! leadership queries, filters namespaces and receives lifecycle callbacks.
//! [`AsyncThreadParam`] drives asynchronous (best-effort) replication,
//! [`ClusterThreadParam`] drives synchronous cluster replication.

use crate::domain::errors::{ReplError, Result};
use crate::domain::ports::ReplicationClient;
use crate::domain::value_objects::NodeUid;
use crate::infrastructure::Terminator;
use crate::replication::config::AsyncReplMode;
use crate::replication::types::ResyncKind;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Replication topology a policy implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplMode {
    Async,
    Cluster,
}

impl ReplMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Cluster => "sync",
        }
    }

    /// Follower namespaces are switched to `SimpleReplica` of this leader.
    pub fn assigns_simple_replica(&self) -> bool {
        *self == Self::Async
    }

    /// Full sync completes only once the follower reports itself as a
    /// cluster replica of this leader.
    pub fn awaits_cluster_role(&self) -> bool {
        *self == Self::Cluster
    }

    /// Node online/offline status is published to stats.
    pub fn tracks_node_status(&self) -> bool {
        *self == Self::Async
    }

    /// Live records are filtered by the per-node namespace config.
    pub fn filters_live_updates(&self) -> bool {
        *self == Self::Async
    }
}

#[async_trait]
pub trait BehaviorPolicy: Send + Sync + 'static {
    fn mode(&self) -> ReplMode;

    fn is_leader(&self) -> bool;

    /// Block until replication is permitted or the thread terminates.
    async fn await_repl_permission(&self, terminator: &Terminator);

    fn is_namespace_in_config(&self, node: NodeUid, ns: &str) -> bool;

    /// Whether a resync record of `kind` restarts full sync for the node.
    fn requires_resync(&self, kind: ResyncKind) -> bool;

    /// Node specific admission check run before every full sync.
    async fn check_replication_allowed(
        &self,
        node: NodeUid,
        client: &dyn ReplicationClient,
    ) -> Result<()>;

    fn on_update_replication_failure(&self) {}

    fn on_node_became_unsynchronized(&self, _node: NodeUid) {}

    fn on_all_updates_replicated(&self, _node: NodeUid, _last_update_id: i64) {}

    fn on_update_succeed(&self, _node: NodeUid, _update_id: u64) {}
}

/// Open/closed permission shared between a driver and its thread.
#[derive(Clone)]
pub struct PermissionGate {
    open: Arc<watch::Sender<bool>>,
}

impl PermissionGate {
    pub fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self { open: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn close(&self) {
        self.open.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Resolve once the gate is open or the terminator fires.
    pub async fn wait(&self, terminator: &Terminator) {
        let mut rx = self.open.subscribe();
        loop {
            if *rx.borrow_and_update() || terminator.is_set() {
                return;
            }
            tokio::select! {
                res = rx.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
                _ = terminator.wait() => return,
            }
        }
    }
}

/// Namespace scope of async replication.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    global: HashSet<String>,
    per_node: HashMap<NodeUid, HashSet<String>>,
}

impl NamespaceFilter {
    pub fn new(global: impl IntoIterator<Item = String>) -> Self {
        Self {
            global: global.into_iter().collect(),
            per_node: HashMap::new(),
        }
    }

    pub fn with_node(
        mut self,
        node: NodeUid,
        namespaces: impl IntoIterator<Item = String>,
    ) -> Self {
        self.per_node.insert(node, namespaces.into_iter().collect());
        self
    }

    /// Empty lists mean "every namespace".
    pub fn contains(&self, node: NodeUid, ns: &str) -> bool {
        let set = self.per_node.get(&node).unwrap_or(&self.global);
        set.is_empty() || set.contains(ns)
    }
}

/// Policy of asynchronous replication threads.
pub struct AsyncThreadParam {
    namespaces: Arc<NamespaceFilter>,
    node_modes: HashMap<NodeUid, AsyncReplMode>,
    gate: PermissionGate,
    cluster_leader: Arc<AtomicBool>,
}

impl AsyncThreadParam {
    pub fn new(
        namespaces: Arc<NamespaceFilter>,
        node_modes: HashMap<NodeUid, AsyncReplMode>,
        gate: PermissionGate,
        cluster_leader: Arc<AtomicBool>,
    ) -> Self {
        Self {
            namespaces,
            node_modes,
            gate,
            cluster_leader,
        }
    }

    fn check_replication_mode(&self, node: NodeUid) -> Result<()> {
        let mode = self.node_modes.get(&node).copied().unwrap_or_default();
        if mode == AsyncReplMode::FromClusterLeader && !self.cluster_leader.load(Ordering::SeqCst) {
            return Err(ReplError::NotAllowed(
                "node accepts updates from the sync cluster leader only".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BehaviorPolicy for AsyncThreadParam {
    fn mode(&self) -> ReplMode {
        ReplMode::Async
    }

    fn is_leader(&self) -> bool {
        self.gate.is_open()
    }

    async fn await_repl_permission(&self, terminator: &Terminator) {
        self.gate.wait(terminator).await;
    }

    fn is_namespace_in_config(&self, node: NodeUid, ns: &str) -> bool {
        self.namespaces.contains(node, ns)
    }

    fn requires_resync(&self, _kind: ResyncKind) -> bool {
        true
    }

    async fn check_replication_allowed(
        &self,
        node: NodeUid,
        client: &dyn ReplicationClient,
    ) -> Result<()> {
        self.check_replication_mode(node)?;
        tracing::debug!("[async] checking if replication is allowed for node {}", node);
        let Some(stats) = client.cluster_replication_stats().await? else {
            return Ok(());
        };
        if stats.namespaces.is_empty() {
            return Err(ReplError::NotAllowed(
                "target node has sync cluster config over all the namespaces".into(),
            ));
        }
        if let Some(ns) = stats
            .namespaces
            .iter()
            .find(|ns| self.is_namespace_in_config(node, ns))
        {
            return Err(ReplError::NotAllowed(format!(
                "namespace '{}' is a part of the sync cluster on the target node",
                ns
            )));
        }
        Ok(())
    }
}

/// Raft role of the local node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RaftRole {
    #[default]
    None,
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Default)]
struct SyncStateInner {
    role: RaftRole,
    initial_sync_done: bool,
}

/// Cluster-wide role and synchronization state, shared with elections.
#[derive(Clone, Default)]
pub struct SharedSyncState {
    inner: Arc<RwLock<SyncStateInner>>,
}

impl SharedSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_role(&self, role: RaftRole) {
        self.inner.write().role = role;
    }

    pub fn current_role(&self) -> RaftRole {
        self.inner.read().role
    }

    pub fn set_initial_sync_done(&self, done: bool) {
        self.inner.write().initial_sync_done = done;
    }

    pub fn is_initial_sync_done(&self) -> bool {
        self.inner.read().initial_sync_done
    }
}

/// Tracks up to which update id each node is synchronized.
#[derive(Clone, Default)]
pub struct SynchronizationList {
    nodes: Arc<DashMap<NodeUid, i64>>,
}

impl SynchronizationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_synchronized(&self, node: NodeUid, update_id: i64) {
        self.nodes
            .entry(node)
            .and_modify(|id| *id = (*id).max(update_id))
            .or_insert(update_id);
    }

    pub fn mark_unsynchronized(&self, node: NodeUid) {
        self.nodes.remove(&node);
    }

    pub fn synchronized_up_to(&self, node: NodeUid) -> Option<i64> {
        self.nodes.get(&node).map(|id| *id)
    }

    /// Nodes that applied every update up to `update_id`.
    pub fn synchronized_count(&self, update_id: i64) -> usize {
        self.nodes.iter().filter(|e| *e.value() >= update_id).count()
    }
}

/// Policy of the synchronous cluster replication thread.
pub struct ClusterThreadParam {
    namespaces: Arc<HashSet<String>>,
    gate: PermissionGate,
    sync_state: SharedSyncState,
    sync_list: SynchronizationList,
    request_elections: Arc<dyn Fn() + Send + Sync>,
}

impl ClusterThreadParam {
    pub fn new(
        namespaces: Arc<HashSet<String>>,
        gate: PermissionGate,
        sync_state: SharedSyncState,
        sync_list: SynchronizationList,
        request_elections: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            namespaces,
            gate,
            sync_state,
            sync_list,
            request_elections,
        }
    }
}

#[async_trait]
impl BehaviorPolicy for ClusterThreadParam {
    fn mode(&self) -> ReplMode {
        ReplMode::Cluster
    }

    fn is_leader(&self) -> bool {
        self.gate.is_open()
    }

    async fn await_repl_permission(&self, terminator: &Terminator) {
        self.gate.wait(terminator).await;
    }

    fn is_namespace_in_config(&self, _node: NodeUid, ns: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.contains(ns)
    }

    fn requires_resync(&self, kind: ResyncKind) -> bool {
        matches!(kind, ResyncKind::Generic | ResyncKind::OnUpdatesDrop)
    }

    async fn check_replication_allowed(
        &self,
        _node: NodeUid,
        _client: &dyn ReplicationClient,
    ) -> Result<()> {
        Ok(())
    }

    fn on_update_replication_failure(&self) {
        if self.sync_state.current_role() == RaftRole::Leader {
            (self.request_elections)();
        }
    }

    fn on_node_became_unsynchronized(&self, node: NodeUid) {
        self.sync_list.mark_unsynchronized(node);
    }

    fn on_all_updates_replicated(&self, node: NodeUid, last_update_id: i64) {
        self.sync_list.mark_synchronized(node, last_update_id);
    }

    fn on_update_succeed(&self, node: NodeUid, update_id: u64) {
        self.sync_list.mark_synchronized(node, update_id as i64);
    }
}
