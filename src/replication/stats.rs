//! Replication statistics.
//!
//! Observability snapshot of the replication core: per-node status, sync
//! state and last error, plus accumulated sync timings.

use crate::domain::errors::ReplError;
use crate::domain::value_objects::{NodeUid, ServerId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    None,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    None,
    AwaitingResync,
    Syncing,
    OnlineReplication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    WalSync,
    ForceSync,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub uid: NodeUid,
    pub server_id: i32,
    pub dsn: String,
    pub status: NodeStatus,
    pub sync_state: SyncState,
    pub last_error: Option<String>,
    pub last_applied_update_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncTimes {
    pub count: u64,
    pub total_time_us: u64,
    pub last_time_us: u64,
}

impl SyncTimes {
    fn record(&mut self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.count += 1;
        self.total_time_us += us;
        self.last_time_us = us;
    }

    pub fn avg_time_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_time_us / self.count
        }
    }
}

/// Serializable snapshot returned to monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationStats {
    pub kind: String,
    pub nodes: Vec<NodeStats>,
    pub wal_sync: SyncTimes,
    pub force_sync: SyncTimes,
}

impl ReplicationStats {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn node(&self, uid: NodeUid) -> Option<&NodeStats> {
        self.nodes.iter().find(|n| n.uid == uid)
    }
}

/// Shared, cheaply cloneable stats sink.
#[derive(Clone)]
pub struct ReplicationStatsCollector {
    kind: &'static str,
    nodes: Arc<DashMap<NodeUid, NodeStats>>,
    times: Arc<Mutex<(SyncTimes, SyncTimes)>>,
}

impl ReplicationStatsCollector {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            nodes: Arc::new(DashMap::new()),
            times: Arc::new(Mutex::new((SyncTimes::default(), SyncTimes::default()))),
        }
    }

    pub fn register_node(&self, uid: NodeUid, server_id: ServerId, dsn: &str) {
        self.nodes.insert(
            uid,
            NodeStats {
                uid,
                server_id: server_id.0,
                dsn: dsn.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn on_status_changed(&self, uid: NodeUid, status: NodeStatus) {
        if let Some(mut node) = self.nodes.get_mut(&uid) {
            node.status = status;
        }
    }

    pub fn on_sync_state_changed(&self, uid: NodeUid, state: SyncState) {
        if let Some(mut node) = self.nodes.get_mut(&uid) {
            node.sync_state = state;
        }
    }

    /// Store the node's last error; `None` resets it.
    pub fn save_node_error(&self, uid: NodeUid, err: Option<&ReplError>) {
        if let Some(mut node) = self.nodes.get_mut(&uid) {
            node.last_error = err.map(ToString::to_string);
        }
    }

    pub fn on_update_applied(&self, uid: NodeUid, update_id: u64) {
        if let Some(mut node) = self.nodes.get_mut(&uid) {
            node.last_applied_update_id = Some(update_id);
        }
    }

    pub fn on_sync_finished(&self, kind: SyncKind, elapsed: Duration) {
        let mut times = self.times.lock();
        match kind {
            SyncKind::WalSync => times.0.record(elapsed),
            SyncKind::ForceSync => times.1.record(elapsed),
        }
    }

    /// Start timing a namespace sync; recorded when the guard drops.
    pub fn sync_timer(&self, kind: SyncKind) -> SyncTimeCounter {
        SyncTimeCounter {
            kind,
            started: Instant::now(),
            collector: self.clone(),
        }
    }

    pub fn node_stats(&self, uid: NodeUid) -> Option<NodeStats> {
        self.nodes.get(&uid).map(|n| n.clone())
    }

    pub fn snapshot(&self) -> ReplicationStats {
        let mut nodes: Vec<NodeStats> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by_key(|n| n.uid);
        let times = self.times.lock();
        ReplicationStats {
            kind: self.kind.to_string(),
            nodes,
            wal_sync: times.0,
            force_sync: times.1,
        }
    }
}

/// RAII timer for one namespace sync.
pub struct SyncTimeCounter {
    kind: SyncKind,
    started: Instant,
    collector: ReplicationStatsCollector,
}

impl SyncTimeCounter {
    pub fn set_kind(&mut self, kind: SyncKind) {
        self.kind = kind;
    }
}

impl Drop for SyncTimeCounter {
    fn drop(&mut self) {
        self.collector.on_sync_finished(self.kind, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_lifecycle() {
        let stats = ReplicationStatsCollector::new("async");
        stats.register_node(1, ServerId(2), "mem://f1");
        stats.on_status_changed(1, NodeStatus::Online);
        stats.on_sync_state_changed(1, SyncState::OnlineReplication);
        stats.on_update_applied(1, 42);

        let node = stats.node_stats(1).unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.sync_state, SyncState::OnlineReplication);
        assert_eq!(node.last_applied_update_id, Some(42));
    }

    #[test]
    fn test_unknown_node_is_ignored() {
        let stats = ReplicationStatsCollector::new("async");
        stats.on_status_changed(9, NodeStatus::Online);
        assert!(stats.node_stats(9).is_none());
    }

    #[test]
    fn test_last_error() {
        let stats = ReplicationStatsCollector::new("cluster");
        stats.register_node(0, ServerId(1), "mem://f0");
        stats.save_node_error(0, Some(&ReplError::Network("refused".into())));
        assert_eq!(
            stats.node_stats(0).unwrap().last_error.as_deref(),
            Some("network error: refused")
        );
        stats.save_node_error(0, None);
        assert!(stats.node_stats(0).unwrap().last_error.is_none());
    }

    #[test]
    fn test_sync_timer() {
        let stats = ReplicationStatsCollector::new("async");
        {
            let _timer = stats.sync_timer(SyncKind::WalSync);
        }
        {
            let mut timer = stats.sync_timer(SyncKind::WalSync);
            timer.set_kind(SyncKind::ForceSync);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.wal_sync.count, 1);
        assert_eq!(snapshot.force_sync.count, 1);
    }

    #[test]
    fn test_snapshot_json() {
        let stats = ReplicationStatsCollector::new("async");
        stats.register_node(0, ServerId(2), "mem://f0");
        stats.on_sync_state_changed(0, SyncState::AwaitingResync);
        let json = stats.snapshot().to_json().unwrap();
        assert!(json.contains("\"sync_state\":\"awaiting_resync\""));
        assert!(json.contains("\"kind\":\"async\""));
    }
}
