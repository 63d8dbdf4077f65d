//! In-Memory Replication Client
//!
//! Implements ReplicationClient on top of an `InMemoryStorage` standing in
//! for a remote follower. The simulated link can be cut, calls can be
//! delayed and mutations can be made to fail, so replication tests can
//! drive every error path without a network.

use super::memory_storage::{InMemoryStorage, WalOp};
use crate::domain::entities::{
    ClusterizationStatus, IndexDef, ItemModifyMode, NamespaceDef, NsReplicationOpts,
    RemoteClusterStats, ReplicationState, SnapshotChunk, TagsMatcher,
};
use crate::domain::errors::{ReplError, Result};
use crate::domain::ports::{
    ClientConfig, ClientFactory, ClientTransaction, ConnectionObserver, ObserverId,
    ReplicationClient,
};
use crate::domain::value_objects::{Lsn, ServerId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn item_string(item: &Bytes) -> Result<String> {
    String::from_utf8(item.to_vec())
        .map_err(|e| ReplError::Logic(format!("item is not utf-8: {}", e)))
}

/// Client bound to one in-memory follower.
pub struct InMemoryClient {
    storage: Arc<InMemoryStorage>,
    reachable: AtomicBool,
    stopped: AtomicBool,
    latency: RwLock<Option<Duration>>,
    update_error: RwLock<Option<ReplError>>,
    fail_next: Mutex<VecDeque<ReplError>>,
    torn_chunks: AtomicUsize,
    observers: DashMap<ObserverId, ConnectionObserver>,
    next_observer: AtomicU64,
    remote_stats: RwLock<Option<RemoteClusterStats>>,
    calls: DashMap<&'static str, usize>,
}

impl InMemoryClient {
    pub fn new(storage: Arc<InMemoryStorage>) -> Self {
        Self {
            storage,
            reachable: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            latency: RwLock::new(None),
            update_error: RwLock::new(None),
            fail_next: Mutex::new(VecDeque::new()),
            torn_chunks: AtomicUsize::new(0),
            observers: DashMap::new(),
            next_observer: AtomicU64::new(1),
            remote_stats: RwLock::new(None),
            calls: DashMap::new(),
        }
    }

    /// Client of a node nobody answers on.
    pub fn unreachable() -> Self {
        let client = Self::new(Arc::new(InMemoryStorage::new(ServerId(-1))));
        client.reachable.store(false, Ordering::SeqCst);
        client
    }

    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    /// Cut or restore the link. Cutting it notifies connection observers.
    pub fn set_reachable(&self, reachable: bool) {
        let was = self.reachable.swap(reachable, Ordering::SeqCst);
        if was && !reachable {
            let err = ReplError::Network("connection reset by peer".into());
            let observers: Vec<ConnectionObserver> =
                self.observers.iter().map(|e| e.value().clone()).collect();
            for observer in observers {
                observer(&err);
            }
        }
    }

    /// Delay every mutating call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Fail every live update with `err` until reset with `None`.
    pub fn set_update_error(&self, err: Option<ReplError>) {
        *self.update_error.write() = err;
    }

    /// Fail the next live update with `err`.
    pub fn fail_next(&self, err: ReplError) {
        self.fail_next.lock().push_back(err);
    }

    /// Leave a stray item behind each of the next `count` applied snapshot
    /// chunks, so the synced data no longer matches the leader's hash.
    pub fn tear_snapshot_chunks(&self, count: usize) {
        self.torn_chunks.store(count, Ordering::SeqCst);
    }

    pub fn set_remote_stats(&self, stats: Option<RemoteClusterStats>) {
        *self.remote_stats.write() = stats;
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.calls.get(call).map(|c| *c).unwrap_or(0)
    }

    pub fn observers_count(&self) -> usize {
        self.observers.len()
    }

    fn track(&self, call: &'static str) {
        *self.calls.entry(call).or_insert(0) += 1;
    }

    fn check_session(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ReplError::Network("node is unreachable".into()));
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ReplError::Network("client is not connected".into()));
        }
        Ok(())
    }

    async fn before_update(&self) -> Result<()> {
        self.check_session()?;
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
            self.check_session()?;
        }
        if let Some(err) = self.fail_next.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.update_error.read().clone() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicationClient for InMemoryClient {
    async fn connect(&self, dsn: &str) -> Result<()> {
        self.track("connect");
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ReplError::Network(format!("unable to connect to {}", dsn)));
        }
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn status(&self, _timeout: Duration) -> Result<()> {
        self.track("status");
        self.check_session()
    }

    async fn get_repl_state(&self, ns: Option<&str>) -> Result<ReplicationState> {
        self.check_session()?;
        match ns {
            Some(ns) => self.storage.repl_state(ns),
            None => Ok(self.storage.db_repl_state()),
        }
    }

    async fn set_clusterization_status(
        &self,
        ns: &str,
        status: ClusterizationStatus,
    ) -> Result<()> {
        self.check_session()?;
        self.track("set_clusterization_status");
        self.storage.set_ns_cluster_status(ns, status)
    }

    async fn cluster_replication_stats(&self) -> Result<Option<RemoteClusterStats>> {
        self.check_session()?;
        Ok(self.remote_stats.read().clone())
    }

    async fn refresh_tags_matcher(&self, ns: &str) -> Result<()> {
        self.check_session()?;
        self.track("refresh_tags_matcher");
        self.storage.repl_state(ns).map(|_| ())
    }

    async fn apply_snapshot_chunk(&self, ns: &str, chunk: &SnapshotChunk, _lsn: Lsn) -> Result<()> {
        self.check_session()?;
        self.track("apply_snapshot_chunk");
        self.storage.apply_chunk(ns, chunk)?;
        let torn = self
            .torn_chunks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if torn {
            self.storage.put_item_unlogged(ns, r#"{"id":-1,"torn":true}"#)?;
        }
        Ok(())
    }

    async fn create_temporary_namespace(
        &self,
        base: &str,
        ns_version: Lsn,
        _lsn: Lsn,
    ) -> Result<String> {
        self.check_session()?;
        self.track("create_temporary_namespace");
        Ok(self.storage.create_tmp_namespace(base, ns_version))
    }

    async fn rename_namespace(&self, from: &str, to: &str, _lsn: Lsn) -> Result<()> {
        self.check_session()?;
        self.track("rename_namespace");
        self.storage.rename(from, to)
    }

    async fn drop_namespace(&self, ns: &str, _lsn: Lsn) -> Result<()> {
        self.check_session()?;
        self.track("drop_namespace");
        self.storage.drop_replicated_namespace(ns)
    }

    async fn add_namespace(
        &self,
        def: &NamespaceDef,
        opts: NsReplicationOpts,
        _lsn: Lsn,
    ) -> Result<()> {
        self.check_session()?;
        self.track("add_namespace");
        self.storage.add_replicated_namespace(def, opts)
    }

    async fn truncate_namespace(&self, ns: &str, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        self.storage.apply_op(ns, WalOp::Truncate, lsn)
    }

    async fn modify_item(
        &self,
        ns: &str,
        mode: ItemModifyMode,
        item: &Bytes,
        lsn: Lsn,
    ) -> Result<()> {
        self.before_update().await?;
        self.track("modify_item");
        let item = item_string(item)?;
        self.storage.apply_op(ns, WalOp::Modify { mode, item }, lsn)
    }

    async fn add_index(&self, ns: &str, index: &IndexDef, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        self.storage.apply_op(ns, WalOp::AddIndex(index.clone()), lsn)
    }

    async fn drop_index(&self, ns: &str, index: &IndexDef, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        self.storage.apply_op(ns, WalOp::DropIndex(index.clone()), lsn)
    }

    async fn update_index(&self, ns: &str, index: &IndexDef, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        self.storage.apply_op(ns, WalOp::UpdateIndex(index.clone()), lsn)
    }

    async fn put_meta(&self, ns: &str, key: &str, value: &str, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        let op = WalOp::PutMeta {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.storage.apply_op(ns, op, lsn)
    }

    async fn set_schema(&self, ns: &str, schema: &str, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        self.storage.apply_op(ns, WalOp::SetSchema(schema.to_string()), lsn)
    }

    async fn set_tags_matcher(&self, ns: &str, tm: &TagsMatcher, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        self.storage.apply_op(ns, WalOp::SetTagsMatcher(tm.clone()), lsn)
    }

    async fn update_query(&self, ns: &str, sql: &str, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        let op = WalOp::Query {
            sql: sql.to_string(),
            delete: false,
        };
        self.storage.apply_op(ns, op, lsn)
    }

    async fn delete_query(&self, ns: &str, sql: &str, lsn: Lsn) -> Result<()> {
        self.before_update().await?;
        let op = WalOp::Query {
            sql: sql.to_string(),
            delete: true,
        };
        self.storage.apply_op(ns, op, lsn)
    }

    async fn begin_transaction(&self, ns: &str, lsn: Lsn) -> Result<Box<dyn ClientTransaction>> {
        self.before_update().await?;
        self.track("begin_transaction");
        self.storage.repl_state(ns)?;
        Ok(Box::new(InMemoryTransaction {
            storage: self.storage.clone(),
            ns: ns.to_string(),
            begin_lsn: lsn,
            ops: Vec::new(),
        }))
    }

    fn add_connection_observer(&self, observer: ConnectionObserver) -> ObserverId {
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        self.observers.insert(id, observer);
        id
    }

    fn remove_connection_observer(&self, id: ObserverId) {
        self.observers.remove(&id);
    }
}

/// Buffered follower transaction, applied on commit.
pub struct InMemoryTransaction {
    storage: Arc<InMemoryStorage>,
    ns: String,
    begin_lsn: Lsn,
    ops: Vec<(WalOp, Lsn)>,
}

#[async_trait]
impl ClientTransaction for InMemoryTransaction {
    async fn modify_item(&mut self, mode: ItemModifyMode, item: &Bytes, lsn: Lsn) -> Result<()> {
        let item = item_string(item)?;
        self.ops.push((WalOp::Modify { mode, item }, lsn));
        Ok(())
    }

    async fn modify_query(&mut self, sql: &str, delete: bool, lsn: Lsn) -> Result<()> {
        let op = WalOp::Query {
            sql: sql.to_string(),
            delete,
        };
        self.ops.push((op, lsn));
        Ok(())
    }

    async fn put_meta(&mut self, key: &str, value: &str, lsn: Lsn) -> Result<()> {
        let op = WalOp::PutMeta {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.ops.push((op, lsn));
        Ok(())
    }

    async fn set_tags_matcher(&mut self, tm: &TagsMatcher, lsn: Lsn) -> Result<()> {
        self.ops.push((WalOp::SetTagsMatcher(tm.clone()), lsn));
        Ok(())
    }

    async fn commit(self: Box<Self>, lsn: Lsn) -> Result<()> {
        let this = *self;
        this.storage.apply_op(&this.ns, WalOp::TxBegin, this.begin_lsn)?;
        for (op, op_lsn) in this.ops {
            this.storage.apply_op(&this.ns, op, op_lsn)?;
        }
        this.storage.apply_op(&this.ns, WalOp::TxCommit, lsn)
    }

    async fn rollback(self: Box<Self>, lsn: Lsn) -> Result<()> {
        tracing::debug!(
            "rolled back transaction on '{}' with {} pending ops at {}",
            self.ns,
            self.ops.len(),
            lsn
        );
        Ok(())
    }
}

/// Resolves DSNs to registered in-memory clients.
#[derive(Default)]
pub struct InMemoryClientFactory {
    clients: DashMap<String, Arc<InMemoryClient>>,
}

impl InMemoryClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dsn: impl Into<String>, client: Arc<InMemoryClient>) {
        self.clients.insert(dsn.into(), client);
    }
}

impl ClientFactory for InMemoryClientFactory {
    fn new_client(&self, dsn: &str, config: &ClientConfig) -> Arc<dyn ReplicationClient> {
        match self.clients.get(dsn) {
            Some(client) => client.value().clone(),
            None => {
                tracing::warn!("{}: no node is registered at {}", config.app_name, dsn);
                Arc::new(InMemoryClient::unreachable())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn client() -> InMemoryClient {
        let storage = Arc::new(InMemoryStorage::new(ServerId(2)));
        storage
            .add_replicated_namespace(&NamespaceDef::new("items"), NsReplicationOpts::default())
            .unwrap();
        InMemoryClient::new(storage)
    }

    #[tokio::test]
    async fn test_stop_and_reconnect() {
        let client = client();
        client.status(Duration::from_secs(1)).await.unwrap();
        client.stop();
        assert!(client.status(Duration::from_secs(1)).await.unwrap_err().is_network());
        client.connect("mem://f1").await.unwrap();
        client.status(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_notifies_observers() {
        let client = client();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = client.add_connection_observer(Arc::new(move |err: &ReplError| {
            assert!(err.is_network());
            f.fetch_add(1, Ordering::SeqCst);
        }));

        client.set_reachable(false);
        client.set_reachable(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(client.connect("mem://f1").await.is_err());

        client.remove_connection_observer(id);
        client.set_reachable(true);
        client.set_reachable(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_next_applies_once() {
        let client = client();
        client.fail_next(ReplError::Logic("rejected".into()));
        let item = Bytes::from_static(br#"{"id":1}"#);
        let lsn = Lsn::new(ServerId(1), 1);

        assert!(client.modify_item("items", ItemModifyMode::Upsert, &item, lsn).await.is_err());
        client
            .modify_item("items", ItemModifyMode::Upsert, &item, lsn)
            .await
            .unwrap();
        assert_eq!(client.call_count("modify_item"), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_ops() {
        let client = client();
        let mut tx = client
            .begin_transaction("items", Lsn::new(ServerId(1), 1))
            .await
            .unwrap();
        let item = Bytes::from_static(br#"{"id":1}"#);
        tx.modify_item(ItemModifyMode::Insert, &item, Lsn::new(ServerId(1), 2))
            .await
            .unwrap();
        tx.rollback(Lsn::new(ServerId(2), 0)).await.unwrap();
        assert!(client.storage().items("items").unwrap().is_empty());
    }

    #[test]
    fn test_factory_resolves_unknown_dsn_to_unreachable() {
        let factory = InMemoryClientFactory::new();
        let config = ClientConfig {
            app_name: "test".into(),
            net_timeout: Duration::from_secs(1),
            enable_compression: false,
        };
        let client = factory.new_client("mem://nowhere", &config);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert!(rt.block_on(client.status(Duration::from_secs(1))).is_err());
    }
}
