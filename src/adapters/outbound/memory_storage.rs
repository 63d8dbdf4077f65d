//! In-Memory Storage Engine
//!
//! Implements StorageEngine with namespaces kept in a DashMap.
//! Every write is stamped with an LSN and kept in a bounded per-namespace
//! WAL, so snapshots can be served either as a WAL tail or as a raw dump.
//!
//! The same type plays both sides of replication: a leader writes through
//! the `leader` methods (which emit update records into an attached queue),
//! while a follower is mutated through the `follower` methods that
//! `InMemoryClient` calls.

use crate::domain::entities::{
    ClusterRole, ClusterizationStatus, EnumNamespacesOpts, IndexDef, ItemModifyMode, NamespaceDef,
    NsReplicationOpts, ReplicationState, Snapshot, SnapshotChunk, SnapshotOpts, TagsMatcher,
};
use crate::domain::errors::{ReplError, Result};
use crate::domain::ports::StorageEngine;
use crate::domain::value_objects::{ExtendedLsn, Lsn, ServerId};
use crate::replication::{PushHandle, RecordKind, UpdateRecord, UpdatesQueue};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const DEFAULT_WAL_CAPACITY: usize = 10_000;
const WAL_ENTRIES_PER_CHUNK: usize = 64;

/// A logged namespace mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOp {
    Modify { mode: ItemModifyMode, item: String },
    PutMeta { key: String, value: String },
    AddIndex(IndexDef),
    DropIndex(IndexDef),
    UpdateIndex(IndexDef),
    SetSchema(String),
    SetTagsMatcher(TagsMatcher),
    Query { sql: String, delete: bool },
    Truncate,
    TxBegin,
    TxCommit,
}

impl WalOp {
    fn record_kind(&self) -> RecordKind {
        match self.clone() {
            Self::Modify { mode, item } => RecordKind::Item {
                mode,
                item: Bytes::from(item),
            },
            Self::PutMeta { key, value } => RecordKind::PutMeta { key, value },
            Self::AddIndex(index) => RecordKind::IndexAdd(index),
            Self::DropIndex(index) => RecordKind::IndexDrop(index),
            Self::UpdateIndex(index) => RecordKind::IndexUpdate(index),
            Self::SetSchema(schema) => RecordKind::SetSchema(schema),
            Self::SetTagsMatcher(tm) => RecordKind::SetTagsMatcher(tm),
            Self::Query { sql, delete: false } => RecordKind::UpdateQuery(sql),
            Self::Query { sql, delete: true } => RecordKind::DeleteQuery(sql),
            Self::Truncate => RecordKind::Truncate,
            Self::TxBegin => RecordKind::BeginTx,
            Self::TxCommit => RecordKind::CommitTx,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalEntry {
    lsn: Lsn,
    op: WalOp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NamespaceDump {
    items: BTreeMap<String, String>,
    meta: BTreeMap<String, String>,
    indexes: Vec<IndexDef>,
    schema: String,
    tags_matcher: TagsMatcher,
    last_lsn: Lsn,
}

#[derive(Debug, Serialize, Deserialize)]
enum ChunkBody {
    Wal(Vec<WalEntry>),
    Raw(NamespaceDump),
}

fn encode_chunk(body: &ChunkBody, raw: bool) -> Result<SnapshotChunk> {
    let payload = bincode::serialize(body)
        .map_err(|e| ReplError::Logic(format!("failed to encode snapshot chunk: {}", e)))?;
    Ok(SnapshotChunk {
        payload: Bytes::from(payload),
        raw,
    })
}

fn decode_chunk(chunk: &SnapshotChunk) -> Result<ChunkBody> {
    bincode::deserialize(&chunk.payload)
        .map_err(|e| ReplError::Logic(format!("failed to decode snapshot chunk: {}", e)))
}

/// Primary key of a JSON item: its `id` field.
fn item_key(item: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(item)
        .map_err(|e| ReplError::Logic(format!("malformed item: {}", e)))?;
    match value.get("id") {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ReplError::Logic("item has no 'id' field".into())),
    }
}

fn not_found(ns: &str) -> ReplError {
    ReplError::NamespaceNotFound(ns.to_string())
}

struct NamespaceState {
    def: NamespaceDef,
    ns_version: Lsn,
    last_lsn: Lsn,
    items: BTreeMap<String, String>,
    meta: BTreeMap<String, String>,
    schema: String,
    tags_matcher: TagsMatcher,
    queries: Vec<String>,
    wal: VecDeque<WalEntry>,
    /// Highest counter no longer served from the WAL.
    wal_trimmed_through: i64,
    cluster_status: ClusterizationStatus,
}

impl NamespaceState {
    fn new(def: NamespaceDef, ns_version: Lsn) -> Self {
        Self {
            def,
            ns_version,
            last_lsn: Lsn::default(),
            items: BTreeMap::new(),
            meta: BTreeMap::new(),
            schema: String::new(),
            tags_matcher: TagsMatcher::default(),
            queries: Vec::new(),
            wal: VecDeque::new(),
            wal_trimmed_through: 0,
            cluster_status: ClusterizationStatus::default(),
        }
    }

    fn data_hash(&self) -> u64 {
        self.items
            .values()
            .fold(0u64, |h, item| h.wrapping_add(crc32fast::hash(item.as_bytes()) as u64))
    }

    fn apply(&mut self, op: WalOp, lsn: Lsn, wal_capacity: usize) -> Result<()> {
        match &op {
            WalOp::Modify { mode, item } => {
                let key = item_key(item)?;
                match mode {
                    ItemModifyMode::Delete => {
                        self.items.remove(&key);
                    }
                    _ => {
                        self.items.insert(key, item.clone());
                    }
                }
            }
            WalOp::PutMeta { key, value } => {
                self.meta.insert(key.clone(), value.clone());
            }
            WalOp::AddIndex(index) | WalOp::UpdateIndex(index) => {
                self.def.indexes.retain(|i| i.name != index.name);
                self.def.indexes.push(index.clone());
            }
            WalOp::DropIndex(index) => self.def.indexes.retain(|i| i.name != index.name),
            WalOp::SetSchema(schema) => self.schema = schema.clone(),
            WalOp::SetTagsMatcher(tm) => self.tags_matcher = tm.clone(),
            WalOp::Query { sql, .. } => self.queries.push(sql.clone()),
            WalOp::Truncate => self.items.clear(),
            WalOp::TxBegin | WalOp::TxCommit => {}
        }
        if !lsn.is_empty() {
            self.last_lsn = lsn;
        }
        self.wal.push_back(WalEntry { lsn, op });
        while self.wal.len() > wal_capacity {
            if let Some(dropped) = self.wal.pop_front() {
                self.wal_trimmed_through = dropped.lsn.counter;
            }
        }
        Ok(())
    }

    fn dump(&self) -> NamespaceDump {
        NamespaceDump {
            items: self.items.clone(),
            meta: self.meta.clone(),
            indexes: self.def.indexes.clone(),
            schema: self.schema.clone(),
            tags_matcher: self.tags_matcher.clone(),
            last_lsn: self.last_lsn,
        }
    }

    fn load(&mut self, dump: NamespaceDump) {
        self.items = dump.items;
        self.meta = dump.meta;
        self.def.indexes = dump.indexes;
        self.schema = dump.schema;
        self.tags_matcher = dump.tags_matcher;
        self.last_lsn = dump.last_lsn;
        self.wal.clear();
        self.wal_trimmed_through = dump.last_lsn.counter;
    }

    /// WAL tail after `from`, if the log still covers it.
    fn wal_tail(&self, from: &ExtendedLsn, max_depth: i64) -> Option<Vec<WalEntry>> {
        if from.is_empty() || from.ns_version != self.ns_version {
            return None;
        }
        let from_counter = from.lsn.counter;
        if from_counter < self.wal_trimmed_through || from_counter > self.last_lsn.counter {
            return None;
        }
        if max_depth > 0 && self.last_lsn.counter - from_counter > max_depth {
            return None;
        }
        Some(
            self.wal
                .iter()
                .filter(|e| e.lsn.counter > from_counter)
                .cloned()
                .collect(),
        )
    }
}

/// In-memory document database used as leader engine and follower target.
pub struct InMemoryStorage {
    server_id: ServerId,
    namespaces: DashMap<String, NamespaceState>,
    closed: DashMap<String, NamespaceState>,
    db_status: RwLock<ClusterizationStatus>,
    queue: RwLock<Option<Arc<UpdatesQueue>>>,
    next_version: AtomicI64,
    wal_capacity: usize,
}

impl InMemoryStorage {
    pub fn new(server_id: ServerId) -> Self {
        Self::with_wal_capacity(server_id, DEFAULT_WAL_CAPACITY)
    }

    pub fn with_wal_capacity(server_id: ServerId, wal_capacity: usize) -> Self {
        Self {
            server_id,
            namespaces: DashMap::new(),
            closed: DashMap::new(),
            db_status: RwLock::new(ClusterizationStatus::default()),
            queue: RwLock::new(None),
            next_version: AtomicI64::new(1),
            wal_capacity: wal_capacity.max(1),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Emit update records for every leader write into `queue`.
    pub fn attach_queue(&self, queue: Arc<UpdatesQueue>) {
        *self.queue.write() = Some(queue);
    }

    fn emit(&self, records: Vec<UpdateRecord>) -> Option<PushHandle> {
        let queue = self.queue.read().clone()?;
        Some(queue.push(records))
    }

    // Leader side

    /// Create a namespace with a fresh version.
    pub fn create_namespace(&self, def: NamespaceDef) -> Result<Option<PushHandle>> {
        let name = def.name.clone();
        if self.namespaces.contains_key(&name) {
            return Err(ReplError::Logic(format!("namespace '{}' already exists", name)));
        }
        let ns_version = Lsn::new(self.server_id, self.next_version.fetch_add(1, Ordering::SeqCst));
        self.namespaces
            .insert(name.clone(), NamespaceState::new(def.clone(), ns_version));
        tracing::debug!("namespace '{}' created with version {}", name, ns_version);
        let rec = UpdateRecord::new(
            name,
            ExtendedLsn::new(ns_version, Lsn::new(self.server_id, 0)),
            self.server_id,
            RecordKind::AddNamespace {
                def,
                state_token: None,
            },
        );
        Ok(self.emit(vec![rec]))
    }

    pub fn remove_namespace(&self, ns: &str) -> Result<Option<PushHandle>> {
        let (_, state) = self.namespaces.remove(ns).ok_or_else(|| not_found(ns))?;
        let rec = UpdateRecord::new(
            ns,
            ExtendedLsn::new(state.ns_version, state.last_lsn),
            self.server_id,
            RecordKind::DropNamespace,
        );
        Ok(self.emit(vec![rec]))
    }

    /// Unload a namespace; it keeps its data and can be reopened.
    pub fn close_namespace(&self, ns: &str) -> Result<Option<PushHandle>> {
        let (name, state) = self.namespaces.remove(ns).ok_or_else(|| not_found(ns))?;
        let rec = UpdateRecord::new(
            ns,
            ExtendedLsn::new(state.ns_version, state.last_lsn),
            self.server_id,
            RecordKind::CloseNamespace,
        );
        self.closed.insert(name, state);
        Ok(self.emit(vec![rec]))
    }

    pub fn reopen_namespace(&self, ns: &str) -> Result<Option<PushHandle>> {
        let (name, state) = self.closed.remove(ns).ok_or_else(|| not_found(ns))?;
        let rec = UpdateRecord::new(
            ns,
            ExtendedLsn::new(state.ns_version, Lsn::new(self.server_id, 0)),
            self.server_id,
            RecordKind::AddNamespace {
                def: state.def.clone(),
                state_token: None,
            },
        );
        self.namespaces.insert(name, state);
        Ok(self.emit(vec![rec]))
    }

    /// Apply `op` with the next LSN and replicate it.
    pub fn write(&self, ns: &str, op: WalOp) -> Result<Option<PushHandle>> {
        let rec = {
            let mut state = self.namespaces.get_mut(ns).ok_or_else(|| not_found(ns))?;
            let lsn = Lsn::new(self.server_id, state.last_lsn.counter + 1);
            let kind = op.record_kind();
            state.apply(op, lsn, self.wal_capacity)?;
            UpdateRecord::new(ns, ExtendedLsn::new(state.ns_version, lsn), self.server_id, kind)
        };
        Ok(self.emit(vec![rec]))
    }

    pub fn upsert_item(&self, ns: &str, item: &str) -> Result<Option<PushHandle>> {
        self.write(
            ns,
            WalOp::Modify {
                mode: ItemModifyMode::Upsert,
                item: item.to_string(),
            },
        )
    }

    pub fn delete_item(&self, ns: &str, item: &str) -> Result<Option<PushHandle>> {
        self.write(
            ns,
            WalOp::Modify {
                mode: ItemModifyMode::Delete,
                item: item.to_string(),
            },
        )
    }

    /// Apply items atomically and replicate them as one transaction block.
    pub fn commit_transaction(
        &self,
        ns: &str,
        items: Vec<(ItemModifyMode, String)>,
    ) -> Result<Option<PushHandle>> {
        let records = {
            let mut state = self.namespaces.get_mut(ns).ok_or_else(|| not_found(ns))?;
            for (_, item) in &items {
                item_key(item)?;
            }
            let ns_version = state.ns_version;
            let mut counter = state.last_lsn.counter;
            let mut records = Vec::with_capacity(items.len() + 2);
            let mut ops = vec![(WalOp::TxBegin, RecordKind::BeginTx)];
            ops.extend(items.into_iter().map(|(mode, item)| {
                let kind = RecordKind::ItemTx {
                    mode,
                    item: Bytes::from(item.clone()),
                };
                (WalOp::Modify { mode, item }, kind)
            }));
            ops.push((WalOp::TxCommit, RecordKind::CommitTx));

            for (op, kind) in ops {
                counter += 1;
                let lsn = Lsn::new(self.server_id, counter);
                state.apply(op, lsn, self.wal_capacity)?;
                records.push(UpdateRecord::new(
                    ns,
                    ExtendedLsn::new(ns_version, lsn),
                    self.server_id,
                    kind,
                ));
            }
            records
        };
        Ok(self.emit(records))
    }

    /// Replicate a rename. Data stays local.
    pub fn rename_local(&self, from: &str, to: &str) -> Result<Option<PushHandle>> {
        let (_, mut state) = self.namespaces.remove(from).ok_or_else(|| not_found(from))?;
        let ext = ExtendedLsn::new(state.ns_version, state.last_lsn);
        state.def.name = to.to_string();
        self.namespaces.insert(to.to_string(), state);
        let rec = UpdateRecord::new(
            from,
            ext,
            self.server_id,
            RecordKind::RenameNamespace { dst: to.to_string() },
        );
        Ok(self.emit(vec![rec]))
    }

    /// Change an item without logging it, leaving the data hash diverged.
    pub fn put_item_unlogged(&self, ns: &str, item: &str) -> Result<()> {
        let mut state = self.namespaces.get_mut(ns).ok_or_else(|| not_found(ns))?;
        let key = item_key(item)?;
        state.items.insert(key, item.to_string());
        Ok(())
    }

    // Follower side

    pub fn set_db_cluster_status(&self, status: ClusterizationStatus) {
        *self.db_status.write() = status;
    }

    pub fn db_repl_state(&self) -> ReplicationState {
        ReplicationState {
            cluster_status: *self.db_status.read(),
            ..Default::default()
        }
    }

    pub fn repl_state(&self, ns: &str) -> Result<ReplicationState> {
        let state = self.namespaces.get(ns).ok_or_else(|| not_found(ns))?;
        let cluster_status = if state.cluster_status.role == ClusterRole::None {
            *self.db_status.read()
        } else {
            state.cluster_status
        };
        Ok(ReplicationState {
            ns_version: state.ns_version,
            last_lsn: state.last_lsn,
            data_hash: state.data_hash(),
            cluster_status,
        })
    }

    pub fn set_ns_cluster_status(&self, ns: &str, status: ClusterizationStatus) -> Result<()> {
        let mut state = self.namespaces.get_mut(ns).ok_or_else(|| not_found(ns))?;
        state.cluster_status = status;
        Ok(())
    }

    /// Apply a mutation stamped by the leader.
    pub fn apply_op(&self, ns: &str, op: WalOp, lsn: Lsn) -> Result<()> {
        let mut state = self.namespaces.get_mut(ns).ok_or_else(|| not_found(ns))?;
        state.apply(op, lsn, self.wal_capacity)
    }

    pub fn apply_chunk(&self, ns: &str, chunk: &SnapshotChunk) -> Result<()> {
        let body = decode_chunk(chunk)?;
        let mut state = self.namespaces.get_mut(ns).ok_or_else(|| not_found(ns))?;
        match body {
            ChunkBody::Wal(entries) => {
                for entry in entries {
                    state.apply(entry.op, entry.lsn, self.wal_capacity)?;
                }
            }
            ChunkBody::Raw(dump) => state.load(dump),
        }
        Ok(())
    }

    /// Create a namespace unless it already exists.
    pub fn add_replicated_namespace(
        &self,
        def: &NamespaceDef,
        opts: NsReplicationOpts,
    ) -> Result<()> {
        if self.namespaces.contains_key(&def.name) {
            return Ok(());
        }
        self.closed.remove(&def.name);
        self.namespaces
            .insert(def.name.clone(), NamespaceState::new(def.clone(), opts.ns_version));
        Ok(())
    }

    pub fn drop_replicated_namespace(&self, ns: &str) -> Result<()> {
        self.namespaces.remove(ns).map(|_| ()).ok_or_else(|| not_found(ns))
    }

    pub fn create_tmp_namespace(&self, base: &str, ns_version: Lsn) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let name = format!("@{}_tmp_{}", base, suffix);
        let mut def = NamespaceDef::new(name.clone());
        def.is_temporary = true;
        self.namespaces
            .insert(name.clone(), NamespaceState::new(def, ns_version));
        name
    }

    /// Replace `to` with `from`.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (_, mut state) = self.namespaces.remove(from).ok_or_else(|| not_found(from))?;
        state.def.name = to.to_string();
        state.def.is_temporary = false;
        self.namespaces.insert(to.to_string(), state);
        Ok(())
    }

    // Inspection

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_namespace(&self, ns: &str) -> bool {
        self.namespaces.contains_key(ns)
    }

    /// Items ordered by primary key.
    pub fn items(&self, ns: &str) -> Result<Vec<String>> {
        let state = self.namespaces.get(ns).ok_or_else(|| not_found(ns))?;
        Ok(state.items.values().cloned().collect())
    }

    pub fn meta(&self, ns: &str, key: &str) -> Result<Option<String>> {
        let state = self.namespaces.get(ns).ok_or_else(|| not_found(ns))?;
        Ok(state.meta.get(key).cloned())
    }

    pub fn indexes(&self, ns: &str) -> Result<Vec<IndexDef>> {
        let state = self.namespaces.get(ns).ok_or_else(|| not_found(ns))?;
        Ok(state.def.indexes.clone())
    }

    /// Number of WAL entries applied through the log, not via raw dumps.
    pub fn wal_len(&self, ns: &str) -> Result<usize> {
        let state = self.namespaces.get(ns).ok_or_else(|| not_found(ns))?;
        Ok(state.wal.len())
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorage {
    async fn enum_namespaces(&self, opts: EnumNamespacesOpts) -> Result<Vec<NamespaceDef>> {
        let mut defs: Vec<NamespaceDef> = self
            .namespaces
            .iter()
            .map(|e| e.value().def.clone())
            .filter(|def| opts.matches(def))
            .map(|mut def| {
                if opts.only_names {
                    def.indexes.clear();
                }
                def
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn get_repl_state(&self, ns: &str) -> Result<ReplicationState> {
        self.repl_state(ns)
    }

    async fn get_snapshot(&self, ns: &str, opts: SnapshotOpts) -> Result<Snapshot> {
        let state = self.namespaces.get(ns).ok_or_else(|| not_found(ns))?;
        let mut snapshot = Snapshot {
            chunks: Vec::new(),
            ns_version: state.ns_version,
            last_lsn: state.last_lsn,
            expected_data_hash: state.data_hash(),
            has_raw_data: false,
        };

        match state.wal_tail(&opts.from, opts.max_wal_depth) {
            Some(entries) => {
                for part in entries.chunks(WAL_ENTRIES_PER_CHUNK) {
                    snapshot
                        .chunks
                        .push(encode_chunk(&ChunkBody::Wal(part.to_vec()), false)?);
                }
            }
            None => {
                snapshot.has_raw_data = true;
                snapshot
                    .chunks
                    .push(encode_chunk(&ChunkBody::Raw(state.dump()), true)?);
            }
        }
        Ok(snapshot)
    }
}
