//! Integration tests for synchronous cluster replication
//!
//! Quorum accounting on the updates queue and the cluster replication
//! thread reacting to failed followers and role switches.

use docdb_replication::adapters::outbound::{InMemoryClient, InMemoryStorage};
use docdb_replication::domain::entities::{ClusterizationStatus, NamespaceDef};
use docdb_replication::domain::ports::ReplicationClient;
use docdb_replication::replication::{
    consensus_for, ClusterReplThread, NodeConfig, RaftRole, RecordKind, ReaderKey,
    ReplThreadConfig, ReplicationResult, ReplicationStatsCollector, SharedSyncState,
    SynchronizationList, UpdateRecord, UpdatesQueue,
};
use docdb_replication::{ExtendedLsn, Lsn, ReplError, ServerId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const LEADER: ServerId = ServerId(1);

fn record(counter: i64) -> UpdateRecord {
    UpdateRecord::new(
        "items",
        ExtendedLsn::new(Lsn::new(LEADER, 1), Lsn::new(LEADER, counter)),
        LEADER,
        RecordKind::Truncate,
    )
}

/// Two successes out of three reach a consensus of two.
#[tokio::test]
async fn test_quorum_success_with_one_failure() {
    let queue = UpdatesQueue::new(100);
    let handle = queue.push(vec![record(1)]);
    let block = queue.read(handle.first_id(), ReaderKey::next()).unwrap();
    let err = ReplError::Network("node is unreachable".into());

    assert_eq!(
        block.on_update_replicated(1, 2, 3, 0, false, None),
        ReplicationResult::Pending
    );
    assert_eq!(
        block.on_update_replicated(2, 2, 3, 0, false, None),
        ReplicationResult::Success
    );
    // Already decided
    assert_eq!(
        block.on_update_replicated(3, 2, 3, 0, false, Some(&err)),
        ReplicationResult::Pending
    );

    assert_ok!(handle.wait().await);
}

/// The failing follower answering first does not change the outcome.
#[tokio::test]
async fn test_quorum_success_when_failure_arrives_first() {
    let queue = UpdatesQueue::new(100);
    let handle = queue.push(vec![record(1)]);
    let block = queue.read(handle.first_id(), ReaderKey::next()).unwrap();
    let err = ReplError::Network("node is unreachable".into());

    let decisions = [
        block.on_update_replicated(1, 2, 3, 0, false, Some(&err)),
        block.on_update_replicated(2, 2, 3, 0, false, None),
        block.on_update_replicated(3, 2, 3, 0, false, None),
    ];
    assert_eq!(
        decisions,
        [
            ReplicationResult::Pending,
            ReplicationResult::Pending,
            ReplicationResult::Success
        ]
    );
    assert_ok!(handle.wait().await);
}

/// Two failures out of three make the consensus unreachable.
#[tokio::test]
async fn test_quorum_error_with_two_failures() {
    let queue = UpdatesQueue::new(100);
    let handle = queue.push(vec![record(1)]);
    let block = queue.read(handle.first_id(), ReaderKey::next()).unwrap();
    let err = ReplError::Network("node is unreachable".into());

    let decisions = [
        block.on_update_replicated(1, 2, 3, 0, false, None),
        block.on_update_replicated(2, 2, 3, 0, false, Some(&err)),
        block.on_update_replicated(3, 2, 3, 0, false, Some(&err)),
    ];
    let errors = decisions
        .iter()
        .filter(|d| **d == ReplicationResult::Error)
        .count();
    assert_eq!(errors, 1);
    assert!(!decisions.contains(&ReplicationResult::Success));

    assert!(matches!(handle.wait().await, Err(ReplError::ReplicationQuorum(_))));
}

/// The emitter's own acknowledgment counts as an approval even when it
/// carries an error.
#[tokio::test]
async fn test_emitter_counts_as_approval() {
    let queue = UpdatesQueue::new(100);
    let handle = queue.push(vec![record(1)]);
    let block = queue.read(handle.first_id(), ReaderKey::next()).unwrap();
    let err = ReplError::Network("node is unreachable".into());

    assert_eq!(
        block.on_update_replicated(1, 1, 2, 0, true, Some(&err)),
        ReplicationResult::Success
    );
    assert_ok!(handle.wait().await);
}

struct SyncCluster {
    leader: Arc<InMemoryStorage>,
    sync_state: SharedSyncState,
    elections: Arc<AtomicUsize>,
    thread: Arc<ClusterReplThread>,
}

impl SyncCluster {
    fn new() -> Self {
        let queue = Arc::new(UpdatesQueue::new(1000));
        let leader = Arc::new(InMemoryStorage::new(LEADER));
        leader.attach_queue(queue.clone());
        let sync_state = SharedSyncState::new();
        let elections = Arc::new(AtomicUsize::new(0));
        let counter = elections.clone();
        let thread = Arc::new(ClusterReplThread::new(
            LEADER,
            ReplThreadConfig::default()
                .retry_sync_interval(Duration::from_millis(50))
                .backoff_step(Duration::from_millis(10))
                .role_switch(Duration::from_millis(10), 50),
            Arc::new(HashSet::new()),
            leader.clone(),
            queue,
            sync_state.clone(),
            SynchronizationList::new(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ReplicationStatsCollector::new("sync"),
        ));
        Self {
            leader,
            sync_state,
            elections,
            thread,
        }
    }

    fn become_leader(&self) {
        self.sync_state.set_initial_sync_done(true);
        self.sync_state.set_role(RaftRole::Leader);
        self.thread.on_role_switch();
    }

    async fn shutdown(&self) {
        let thread = self.thread.clone();
        tokio::task::spawn_blocking(move || {
            thread.send_terminate();
            thread.await_termination();
        })
        .await
        .unwrap();
    }
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

fn cluster_follower(server_id: i32) -> Arc<InMemoryClient> {
    let storage = Arc::new(InMemoryStorage::new(ServerId(server_id)));
    storage.set_db_cluster_status(ClusterizationStatus::cluster_replica(LEADER));
    Arc::new(InMemoryClient::new(storage))
}

fn node(
    uid: u32,
    server_id: i32,
    client: Arc<InMemoryClient>,
) -> (NodeConfig, Arc<dyn ReplicationClient>) {
    (
        NodeConfig::new(uid, ServerId(server_id), format!("mem://node{}", server_id)),
        client as Arc<dyn ReplicationClient>,
    )
}

/// With every follower reachable, writes reach consensus and no election
/// is requested.
#[tokio::test]
async fn test_healthy_cluster_reaches_consensus() {
    let cluster = SyncCluster::new();
    cluster.leader.create_namespace(NamespaceDef::new("items")).unwrap();
    let followers: Vec<_> = (2..=4).map(cluster_follower).collect();
    let nodes = followers
        .iter()
        .enumerate()
        .map(|(uid, client)| node(uid as u32, uid as i32 + 2, client.clone()))
        .collect();
    assert_eq!(consensus_for(4), 3);

    cluster.thread.run(nodes, 4).unwrap();
    cluster.become_leader();

    let handle = cluster.leader.upsert_item("items", r#"{"id":1}"#).unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cluster.elections.load(Ordering::SeqCst), 0);

    for follower in &followers {
        let storage = follower.storage().clone();
        eventually(move || storage.items("items").map(|i| i.len() == 1).unwrap_or(false)).await;
    }
    cluster.shutdown().await;
}

/// Losing two of three followers fails the write and asks for a new
/// leader election.
#[tokio::test]
async fn test_lost_quorum_requests_reelection() {
    let cluster = SyncCluster::new();
    cluster.leader.create_namespace(NamespaceDef::new("items")).unwrap();
    let alive = cluster_follower(2);
    let nodes = vec![
        node(0, 2, alive.clone()),
        node(1, 3, Arc::new(InMemoryClient::unreachable())),
        node(2, 4, Arc::new(InMemoryClient::unreachable())),
    ];

    cluster.thread.run(nodes, 4).unwrap();
    cluster.become_leader();

    let handle = cluster.leader.upsert_item("items", r#"{"id":1}"#).unwrap().unwrap();
    let res = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert!(matches!(res, Err(ReplError::ReplicationQuorum(_))));
    assert!(cluster.elections.load(Ordering::SeqCst) >= 1);

    cluster.shutdown().await;
}

/// Stepping down stops replication; becoming leader again resyncs the
/// followers first.
#[tokio::test]
async fn test_role_switch_pauses_replication() {
    let cluster = SyncCluster::new();
    cluster.leader.create_namespace(NamespaceDef::new("items")).unwrap();
    let follower = cluster_follower(2);
    let storage = follower.storage().clone();

    cluster.thread.run(vec![node(0, 2, follower.clone())], 2).unwrap();
    cluster.become_leader();
    let handle = cluster.leader.upsert_item("items", r#"{"id":1}"#).unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap()
        .unwrap();

    cluster.sync_state.set_role(RaftRole::Follower);
    cluster.thread.on_role_switch();
    cluster.leader.upsert_item("items", r#"{"id":2}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(storage.items("items").unwrap().len(), 1);

    cluster.become_leader();
    let resynced = storage.clone();
    eventually(move || resynced.items("items").map(|i| i.len() == 2).unwrap_or(false)).await;
    assert_eq!(storage.items("items").unwrap(), cluster.leader.items("items").unwrap());

    cluster.shutdown().await;
}
