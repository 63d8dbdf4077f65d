//! Async Data Replicator
//!
//! Drives asynchronous leader-to-follower replication: splits the configured
//! follower nodes between a small pool of replication threads, starts and
//! stops them, and exposes their aggregated stats.

use crate::domain::ports::{ClientFactory, ReplicationClient, StorageEngine};
use crate::domain::value_objects::{NodeUid, ServerId};
use crate::replication::behavior::{AsyncThreadParam, NamespaceFilter, PermissionGate};
use crate::replication::config::{AsyncReplConfig, AsyncReplRole, ConfigError, NodeConfig};
use crate::replication::queue::UpdatesQueue;
use crate::replication::stats::{ReplicationStats, ReplicationStatsCollector};
use crate::replication::thread::ReplThread;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Threads used when the config leaves the count at 0.
pub const DEFAULT_THREADS_COUNT: usize = 4;

struct RunningThread {
    thread: Arc<ReplThread<AsyncThreadParam>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ReplicatorState {
    config: Option<AsyncReplConfig>,
    threads: Vec<RunningThread>,
}

/// Owner of the async replication threads.
pub struct AsyncDataReplicator {
    server_id: ServerId,
    storage: Arc<dyn StorageEngine>,
    queue: Arc<UpdatesQueue>,
    factory: Arc<dyn ClientFactory>,
    stats: ReplicationStatsCollector,
    gate: PermissionGate,
    cluster_leader: Arc<AtomicBool>,
    state: Mutex<ReplicatorState>,
}

impl AsyncDataReplicator {
    pub fn new(
        server_id: ServerId,
        storage: Arc<dyn StorageEngine>,
        queue: Arc<UpdatesQueue>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            server_id,
            storage,
            queue,
            factory,
            stats: ReplicationStatsCollector::new("async"),
            gate: PermissionGate::new(true),
            cluster_leader: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ReplicatorState::default()),
        }
    }

    /// Apply a new configuration. Running threads are stopped when it
    /// differs from the current one; call [`run`](Self::run) to restart.
    pub fn configure(&self, config: AsyncReplConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut state = self.state.lock();
        let changed = match &state.config {
            Some(current) => !same_config(current, &config),
            None => true,
        };
        if changed && !state.threads.is_empty() {
            tracing::info!(
                "[async] {}: configuration changed, stopping replication",
                self.server_id
            );
            self.stop_locked(&mut state);
        }
        state.config = Some(config);
        Ok(())
    }

    pub fn config(&self) -> Option<AsyncReplConfig> {
        self.state.lock().config.clone()
    }

    /// Configured as a leader with followers but not running yet.
    pub fn is_expecting_startup(&self) -> bool {
        Self::expecting_startup(&self.state.lock())
    }

    fn expecting_startup(state: &ReplicatorState) -> bool {
        state.threads.is_empty()
            && state
                .config
                .as_ref()
                .map_or(false, |c| c.role == AsyncReplRole::Leader && !c.nodes.is_empty())
    }

    pub fn is_running(&self) -> bool {
        !self.state.lock().threads.is_empty()
    }

    /// Whether the local node currently leads its sync cluster. Nodes in
    /// `FromClusterLeader` mode only receive updates while it does.
    pub fn set_cluster_leader(&self, is_leader: bool) {
        self.cluster_leader.store(is_leader, Ordering::SeqCst);
    }

    /// Start replication threads for the configured followers.
    pub fn run(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if !Self::expecting_startup(&state) {
            return Ok(());
        }
        let Some(config) = state.config.clone() else {
            return Ok(());
        };

        let mut filter = NamespaceFilter::new(config.namespaces.iter().cloned());
        let mut modes = HashMap::new();
        for (uid, node) in config.nodes.iter().enumerate() {
            let uid = uid as NodeUid;
            if let Some(namespaces) = &node.namespaces {
                filter = filter.with_node(uid, namespaces.iter().cloned());
            }
            modes.insert(uid, node.mode);
        }
        let filter = Arc::new(filter);

        let threads_count = match config.threads_count {
            0 => DEFAULT_THREADS_COUNT,
            n => n,
        }
        .min(config.nodes.len());
        let client_config = config.thread.client_config();
        let mut per_thread: Vec<Vec<(NodeConfig, Arc<dyn ReplicationClient>)>> =
            (0..threads_count).map(|_| Vec::new()).collect();
        for (uid, node) in config.nodes.iter().enumerate() {
            let cfg = NodeConfig::new(uid as NodeUid, node.server_id, node.dsn.clone());
            let client = self.factory.new_client(&node.dsn, &client_config);
            per_thread[uid % threads_count].push((cfg, client));
        }

        tracing::info!(
            "[async] {}: starting {} replication threads for {} nodes",
            self.server_id,
            threads_count,
            config.nodes.len()
        );
        for nodes in per_thread {
            let policy = AsyncThreadParam::new(
                filter.clone(),
                modes.clone(),
                self.gate.clone(),
                self.cluster_leader.clone(),
            );
            let thread = Arc::new(ReplThread::new(
                self.server_id,
                config.thread.clone(),
                self.storage.clone(),
                self.queue.clone(),
                Arc::new(policy),
                self.stats.clone(),
            ));
            // Every follower reads every record, whichever thread owns it
            let required = config.nodes.len();
            let handle = match thread.clone().spawn(nodes, 0, required) {
                Ok(handle) => handle,
                Err(e) => {
                    self.stop_locked(&mut state);
                    return Err(anyhow::anyhow!("unable to spawn replication thread: {}", e));
                }
            };
            state.threads.push(RunningThread {
                thread,
                handle: Some(handle),
            });
        }
        Ok(())
    }

    /// Stop every thread and wait for them; optionally forget the config.
    pub fn stop(&self, reset_config: bool) {
        let mut state = self.state.lock();
        self.stop_locked(&mut state);
        if reset_config {
            state.config = None;
        }
    }

    fn stop_locked(&self, state: &mut ReplicatorState) {
        if state.threads.is_empty() {
            return;
        }
        for running in &state.threads {
            running.thread.set_terminate(true);
        }
        for running in &mut state.threads {
            if let Some(handle) = running.handle.take() {
                if handle.join().is_err() {
                    tracing::error!("[async] {}: replication thread panicked", self.server_id);
                }
            }
        }
        state.threads.clear();
        tracing::info!("[async] {}: replication stopped", self.server_id);
    }

    /// Suspend replication without dropping the threads.
    pub fn pause(&self) {
        self.gate.close();
        for running in &self.state.lock().threads {
            running.thread.disconnect_nodes();
        }
    }

    /// Resume after [`pause`](Self::pause); every node resyncs first.
    pub fn resume(&self) {
        for running in &self.state.lock().threads {
            running.thread.set_nodes_require_resync();
        }
        self.gate.open();
    }

    pub fn get_replication_stats(&self) -> ReplicationStats {
        self.stats.snapshot()
    }
}

impl Drop for AsyncDataReplicator {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        self.stop_locked(&mut state);
    }
}

fn same_config(a: &AsyncReplConfig, b: &AsyncReplConfig) -> bool {
    a.role == b.role
        && a.nodes == b.nodes
        && a.namespaces == b.namespaces
        && a.threads_count == b.threads_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{InMemoryClient, InMemoryClientFactory, InMemoryStorage};
    use crate::domain::entities::NamespaceDef;
    use crate::replication::config::{AsyncNodeConfig, ReplThreadConfig};
    use std::time::Duration;

    fn setup(
        nodes: usize,
    ) -> (Arc<InMemoryStorage>, Vec<Arc<InMemoryClient>>, AsyncDataReplicator) {
        let queue = Arc::new(UpdatesQueue::new(1000));
        let leader = Arc::new(InMemoryStorage::new(ServerId(1)));
        leader.attach_queue(queue.clone());
        let factory = Arc::new(InMemoryClientFactory::new());
        let mut clients = Vec::new();
        for i in 0..nodes {
            let client = Arc::new(InMemoryClient::new(Arc::new(InMemoryStorage::new(ServerId(
                10 + i as i32,
            )))));
            factory.register(format!("mem://f{}", i), client.clone());
            clients.push(client);
        }
        let replicator = AsyncDataReplicator::new(ServerId(1), leader.clone(), queue, factory);
        (leader, clients, replicator)
    }

    fn config(nodes: usize) -> AsyncReplConfig {
        let nodes = (0..nodes)
            .map(|i| AsyncNodeConfig::new(ServerId(10 + i as i32), format!("mem://f{}", i)))
            .collect();
        AsyncReplConfig::leader(nodes).thread(
            ReplThreadConfig::default()
                .retry_sync_interval(Duration::from_millis(50))
                .backoff_step(Duration::from_millis(10)),
        )
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

    #[test]
    fn test_expecting_startup() {
        let (_leader, _clients, replicator) = setup(1);
        assert!(!replicator.is_expecting_startup());
        replicator.configure(config(1)).unwrap();
        assert!(replicator.is_expecting_startup());
        replicator.configure(AsyncReplConfig::leader(Vec::new())).unwrap();
        assert!(!replicator.is_expecting_startup());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (_leader, _clients, replicator) = setup(0);
        let bad = AsyncReplConfig::leader(vec![AsyncNodeConfig::new(ServerId(2), "")]);
        assert_eq!(replicator.configure(bad), Err(ConfigError::MissingDsn(0)));
        assert!(replicator.config().is_none());
    }

    #[tokio::test]
    async fn test_replicates_to_all_nodes_and_stops() {
        let (leader, clients, replicator) = setup(3);
        leader.create_namespace(NamespaceDef::new("items")).unwrap();
        leader.upsert_item("items", r#"{"id":1}"#).unwrap();

        replicator.configure(config(3).threads_count(2)).unwrap();
        replicator.run().unwrap();
        assert!(replicator.is_running());
        assert!(!replicator.is_expecting_startup());

        for client in &clients {
            let storage = client.storage().clone();
            eventually(move || storage.items("items").map(|i| i.len() == 1).unwrap_or(false)).await;
        }
        let stats = replicator.get_replication_stats();
        assert_eq!(stats.kind, "async");
        assert_eq!(stats.nodes.len(), 3);

        tokio::task::spawn_blocking(move || {
            replicator.stop(true);
            assert!(!replicator.is_running());
            assert!(replicator.config().is_none());
        })
        .await
        .unwrap();
    }
}
