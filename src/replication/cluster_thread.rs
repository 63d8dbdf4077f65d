//! Cluster Replication Thread
//!
//! Drives synchronous replication from the cluster leader to every other
//! cluster member. Replication only runs while the local node is the
//! leader and its initial sync is done; role switches reported by the
//! election layer open or close the permission gate.

use crate::domain::ports::{ClientFactory, ReplicationClient, StorageEngine};
use crate::domain::value_objects::{NodeUid, ServerId};
use crate::replication::behavior::{
    ClusterThreadParam, PermissionGate, RaftRole, SharedSyncState, SynchronizationList,
};
use crate::replication::config::{ClusterConfig, NodeConfig, ReplThreadConfig};
use crate::replication::queue::UpdatesQueue;
use crate::replication::stats::ReplicationStatsCollector;
use crate::replication::thread::ReplThread;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Majority of a cluster of `n` nodes.
pub fn consensus_for(n: usize) -> usize {
    n / 2 + 1
}

/// Owner of the cluster replication thread.
pub struct ClusterReplThread {
    server_id: ServerId,
    thread: Arc<ReplThread<ClusterThreadParam>>,
    gate: PermissionGate,
    sync_state: SharedSyncState,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterReplThread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: ServerId,
        config: ReplThreadConfig,
        namespaces: Arc<HashSet<String>>,
        storage: Arc<dyn StorageEngine>,
        queue: Arc<UpdatesQueue>,
        sync_state: SharedSyncState,
        sync_list: SynchronizationList,
        request_elections: Arc<dyn Fn() + Send + Sync>,
        stats: ReplicationStatsCollector,
    ) -> Self {
        let gate = PermissionGate::new(false);
        let policy = ClusterThreadParam::new(
            namespaces,
            gate.clone(),
            sync_state.clone(),
            sync_list,
            request_elections,
        );
        let thread = Arc::new(ReplThread::new(
            server_id,
            config,
            storage,
            queue,
            Arc::new(policy),
            stats,
        ));
        Self {
            server_id,
            thread,
            gate,
            sync_state,
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Start replicating to `nodes` in a cluster of `total_nodes` members.
    ///
    /// The leader's own write is the first approval of every record, so
    /// followers have to provide the rest of the majority.
    pub fn run(
        &self,
        nodes: Vec<(NodeConfig, Arc<dyn ReplicationClient>)>,
        total_nodes: usize,
    ) -> anyhow::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            anyhow::bail!("cluster replication thread is already running");
        }
        let consensus = consensus_for(total_nodes).saturating_sub(1);
        let required = total_nodes.saturating_sub(1);
        *handle = Some(self.thread.clone().spawn(nodes, consensus, required)?);
        // A role switch may have happened before the thread was started
        self.on_role_switch();
        Ok(())
    }

    /// Start replicating to the followers of `config`.
    pub fn run_with_config(
        &self,
        config: &ClusterConfig,
        factory: &dyn ClientFactory,
    ) -> anyhow::Result<()> {
        config.validate()?;
        let client_config = config.thread.client_config();
        let nodes = config
            .nodes
            .iter()
            .enumerate()
            .map(|(uid, node)| {
                let client = factory.new_client(&node.dsn, &client_config);
                (NodeConfig::new(uid as NodeUid, node.server_id, node.dsn.clone()), client)
            })
            .collect();
        self.run(nodes, config.total_nodes())
    }

    /// Re-evaluate the shared role after the election layer changed it.
    pub fn on_role_switch(&self) {
        if self.thread.is_terminated() {
            return;
        }
        let role = self.sync_state.current_role();
        tracing::info!("[sync] {}: role switched to {:?}", self.server_id, role);
        self.thread.set_nodes_require_resync();
        if role == RaftRole::Leader {
            if !self.gate.is_open() && self.sync_state.is_initial_sync_done() {
                self.gate.open();
            }
        } else {
            if self.gate.is_open() {
                self.gate.close();
            }
            self.thread.disconnect_nodes();
        }
    }

    pub fn send_terminate(&self) {
        self.thread.set_terminate(true);
    }

    /// Join the thread after [`send_terminate`](Self::send_terminate) and
    /// make it ready to run again.
    pub fn await_termination(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[sync] {}: replication thread panicked", self.server_id);
            }
        }
        self.thread.set_terminate(false);
    }
}

impl Drop for ClusterReplThread {
    fn drop(&mut self) {
        if self.is_running() {
            self.send_terminate();
            self.await_termination();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{InMemoryClient, InMemoryStorage};
    use crate::domain::entities::{ClusterizationStatus, NamespaceDef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_consensus_for() {
        assert_eq!(consensus_for(1), 1);
        assert_eq!(consensus_for(2), 2);
        assert_eq!(consensus_for(3), 2);
        assert_eq!(consensus_for(5), 3);
    }

    fn cluster(
        sync_state: SharedSyncState,
        elections: Arc<AtomicUsize>,
    ) -> (Arc<InMemoryStorage>, ClusterReplThread) {
        let queue = Arc::new(UpdatesQueue::new(1000));
        let leader = Arc::new(InMemoryStorage::new(ServerId(1)));
        leader.attach_queue(queue.clone());
        let thread = ClusterReplThread::new(
            ServerId(1),
            ReplThreadConfig::default()
                .retry_sync_interval(Duration::from_millis(50))
                .backoff_step(Duration::from_millis(10))
                .role_switch(Duration::from_millis(10), 50),
            Arc::new(HashSet::new()),
            leader.clone(),
            queue,
            sync_state,
            SynchronizationList::new(),
            Arc::new(move || {
                elections.fetch_add(1, Ordering::SeqCst);
            }),
            ReplicationStatsCollector::new("sync"),
        );
        (leader, thread)
    }

    fn follower(server_id: i32) -> Arc<InMemoryClient> {
        let storage = Arc::new(InMemoryStorage::new(ServerId(server_id)));
        storage.set_db_cluster_status(ClusterizationStatus::cluster_replica(ServerId(1)));
        Arc::new(InMemoryClient::new(storage))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition was not reached in time");
    }

    #[tokio::test]
    async fn test_replicates_only_as_leader() {
        let sync_state = SharedSyncState::new();
        let (leader, thread) = cluster(sync_state.clone(), Arc::new(AtomicUsize::new(0)));
        leader.create_namespace(NamespaceDef::new("items")).unwrap();
        leader.upsert_item("items", r#"{"id":1}"#).unwrap();
        let node = follower(2);
        let storage = node.storage().clone();

        let cfg = NodeConfig::new(0, ServerId(2), "mem://b");
        thread
            .run(vec![(cfg, node.clone() as Arc<dyn ReplicationClient>)], 2)
            .unwrap();
        assert!(thread.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!storage.has_namespace("items"));

        sync_state.set_initial_sync_done(true);
        sync_state.set_role(RaftRole::Leader);
        thread.on_role_switch();
        eventually(|| storage.items("items").map(|i| i.len() == 1).unwrap_or(false)).await;

        sync_state.set_role(RaftRole::Follower);
        thread.on_role_switch();
        leader.upsert_item("items", r#"{"id":2}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.items("items").unwrap().len(), 1);

        tokio::task::spawn_blocking(move || {
            thread.send_terminate();
            thread.await_termination();
            assert!(!thread.is_running());
        })
        .await
        .unwrap();
    }
}
