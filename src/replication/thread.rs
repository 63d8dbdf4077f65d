//! Replication Thread
//!
//! Owns one OS thread running a single-threaded runtime with one routine
//! per follower node. Each routine connects to its node, syncs every
//! replicated namespace and then streams live updates from the shared
//! queue, acknowledging each record into the queue's quorum counters.
//! The behavior policy decides what differs between synchronous cluster
//! replication and async replication.

use crate::domain::entities::{ClusterizationStatus, EnumNamespacesOpts};
use crate::domain::errors::{ReplError, Result};
use crate::domain::ports::{ConnectionObserver, ReplicationClient, StorageEngine};
use crate::domain::value_objects::{Lsn, NodeUid, ServerId};
use crate::infrastructure::Terminator;
use crate::replication::apply::{apply_stateless, apply_update};
use crate::replication::batcher::{first_error, UpdatesBatcher};
use crate::replication::behavior::BehaviorPolicy;
use crate::replication::config::{NodeConfig, ReplThreadConfig};
use crate::replication::node::Node;
use crate::replication::queue::{ReaderKey, ReplicationResult, UpdateBlock, UpdatesQueue};
use crate::replication::stats::{NodeStatus, ReplicationStatsCollector, SyncState};
use crate::replication::sync::{leader_switched, set_failure, NamespaceSyncer};
use crate::replication::types::{Applied, ApplyResult, RecordKind, ResyncKind, UpdateRecord};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify, Semaphore};

/// Handles kept for every running node routine, so the owner can poke
/// nodes from outside the thread.
struct NodeSession {
    client: Arc<dyn ReplicationClient>,
    require_resync: Arc<AtomicBool>,
    notifier: Option<mpsc::Sender<()>>,
}

/// Position of a batched update inside its queue block.
struct BatchCtx {
    block: Arc<UpdateBlock>,
    offset: usize,
}

/// A replication thread parameterized by its behavior policy.
pub struct ReplThread<P: BehaviorPolicy> {
    server_id: ServerId,
    config: ReplThreadConfig,
    storage: Arc<dyn StorageEngine>,
    queue: Arc<UpdatesQueue>,
    policy: Arc<P>,
    stats: ReplicationStatsCollector,
    terminator: Terminator,
    reader: ReaderKey,
    consensus: AtomicUsize,
    required: AtomicUsize,
    sessions: Mutex<Vec<NodeSession>>,
    sync_permits: Option<Semaphore>,
}

impl<P: BehaviorPolicy> ReplThread<P> {
    pub fn new(
        server_id: ServerId,
        config: ReplThreadConfig,
        storage: Arc<dyn StorageEngine>,
        queue: Arc<UpdatesQueue>,
        policy: Arc<P>,
        stats: ReplicationStatsCollector,
    ) -> Self {
        let sync_permits = match config.parallel_syncs_per_thread {
            0 => None,
            n => Some(Semaphore::new(n)),
        };
        Self {
            server_id,
            config,
            storage,
            queue,
            policy,
            stats,
            terminator: Terminator::new(),
            reader: ReaderKey::next(),
            consensus: AtomicUsize::new(0),
            required: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            sync_permits,
        }
    }

    pub fn policy(&self) -> &Arc<P> {
        &self.policy
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator.is_set()
    }

    fn label(&self) -> &'static str {
        self.policy.mode().label()
    }

    fn consensus(&self) -> usize {
        self.consensus.load(Ordering::SeqCst)
    }

    fn required(&self) -> usize {
        self.required.load(Ordering::SeqCst)
    }

    /// Set or reset the terminate flag. Setting it wakes every routine.
    pub fn set_terminate(&self, value: bool) {
        self.terminator.set(value);
    }

    /// Force every node through a full resync on its next iteration.
    pub fn set_nodes_require_resync(&self) {
        for session in self.sessions.lock().iter() {
            session.require_resync.store(true, Ordering::SeqCst);
            if let Some(notifier) = &session.notifier {
                let _ = notifier.try_send(());
            }
        }
    }

    /// Drop every node's session; routines reconnect on their next iteration.
    pub fn disconnect_nodes(&self) {
        for session in self.sessions.lock().iter() {
            session.client.stop();
        }
    }

    /// Run `run` on a dedicated OS thread with its own runtime.
    pub fn spawn(
        self: Arc<Self>,
        nodes: Vec<(NodeConfig, Arc<dyn ReplicationClient>)>,
        consensus: usize,
        required: usize,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        let name = format!("{}-repl-{}", self.label(), self.reader.0);
        std::thread::Builder::new().name(name).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(
                        "[{}] {}: unable to start runtime: {}",
                        self.label(),
                        self.server_id,
                        e
                    );
                    return;
                }
            };
            runtime.block_on(self.run(nodes, consensus, required));
        })
    }

    /// Replicate to `nodes` until terminated.
    ///
    /// A record succeeds once `consensus` nodes approved it and fails once
    /// more than `required - consensus` nodes rejected it.
    pub async fn run(
        &self,
        nodes: Vec<(NodeConfig, Arc<dyn ReplicationClient>)>,
        consensus: usize,
        required: usize,
    ) {
        self.consensus.store(consensus, Ordering::SeqCst);
        self.required.store(required, Ordering::SeqCst);

        self.policy.await_repl_permission(&self.terminator).await;
        if self.terminator.is_set() {
            return;
        }

        let list: Vec<String> = nodes
            .iter()
            .map(|(cfg, _)| format!("{}:{}", cfg.uid, cfg.dsn))
            .collect();
        tracing::info!(
            "[{}] {}: replicating to nodes [{}], consensus {}, required replicas {}",
            self.label(),
            self.server_id,
            list.join(", "),
            consensus,
            required
        );

        let data_notifier = Arc::new(Notify::new());
        self.queue.add_data_notifier(self.reader, data_notifier.clone());

        let mut routines = Vec::with_capacity(nodes.len());
        for (cfg, client) in nodes {
            self.stats.register_node(cfg.uid, cfg.server_id, &cfg.dsn);
            let (tx, rx) = mpsc::channel(1);
            let node = Node::new(&cfg, client.clone(), rx);
            self.sessions.lock().push(NodeSession {
                client,
                require_resync: node.require_resync.clone(),
                notifier: Some(tx),
            });
            routines.push(self.node_routine(node));
        }

        futures::join!(join_all(routines), self.fan_out_updates(data_notifier));

        self.sessions.lock().clear();
        self.queue.remove_data_notifier(self.reader);
        tracing::info!("[{}] {}: replication thread finished", self.label(), self.server_id);
    }

    /// Forward queue notifications to every node until terminated.
    async fn fan_out_updates(&self, data_notifier: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = data_notifier.notified() => {
                    for session in self.sessions.lock().iter() {
                        if let Some(notifier) = &session.notifier {
                            let _ = notifier.try_send(());
                        }
                    }
                }
                _ = self.terminator.wait() => break,
            }
        }
        self.disconnect_nodes();
        for session in self.sessions.lock().iter_mut() {
            session.notifier = None;
        }
    }

    fn connection_observer(&self, node: &Node) -> ConnectionObserver {
        let queue = self.queue.clone();
        let terminator = self.terminator.clone();
        let require_resync = node.require_resync.clone();
        let (label, server_id, uid) = (self.label(), self.server_id, node.uid);
        Arc::new(move |err: &ReplError| {
            if terminator.is_set() {
                return;
            }
            tracing::info!("[{}] {}:{} connection error: {}", label, server_id, uid, err);
            require_resync.store(true, Ordering::SeqCst);
            queue.push_async(vec![UpdateRecord::network_check(uid, false)]);
        })
    }

    async fn node_routine(&self, mut node: Node) {
        let _guard = self.terminator.routine_guard();
        let uid = node.uid;
        node.next_update_id = self.queue.register_reader(node.reader);
        let mut expecting_reconnect = true;
        let mut last_error: Option<ReplError> = None;

        while !self.terminator.is_set() {
            self.stats.on_sync_state_changed(uid, SyncState::AwaitingResync);
            self.policy.await_repl_permission(&self.terminator).await;
            if self.terminator.is_set() {
                break;
            }

            if expecting_reconnect {
                let reason = match &last_error {
                    Some(err) => Some(err.clone()),
                    None => node.client.status(self.config.status_timeout).await.err(),
                };
                if let Some(reason) = reason {
                    tracing::info!(
                        "[{}] {}:{} reconnecting to {}: {}",
                        self.label(),
                        self.server_id,
                        uid,
                        node.dsn,
                        reason
                    );
                    node.reconnect().await;
                }
            }

            let allowed = self
                .policy
                .check_replication_allowed(uid, node.client.as_ref())
                .await;
            self.stats.save_node_error(uid, allowed.as_ref().err());
            let res = match allowed {
                Ok(()) => {
                    expecting_reconnect = true;
                    if node.conn_observer_id.is_none() {
                        let observer = self.connection_observer(&node);
                        node.conn_observer_id = Some(node.client.add_connection_observer(observer));
                    }
                    let res = self.node_replication_impl(&mut node).await;
                    self.stats.save_node_error(uid, res.as_ref().err());
                    res
                }
                Err(e) => {
                    expecting_reconnect = false;
                    tracing::info!(
                        "[{}] {}:{} replication is not allowed: {}",
                        self.label(),
                        self.server_id,
                        uid,
                        e
                    );
                    Err(e)
                }
            };

            if !self.terminator.is_set() {
                if res.is_ok() {
                    tracing::trace!("[{}] {}:{} doing resync", self.label(), self.server_id, uid);
                    last_error = None;
                    continue;
                }
                self.policy.on_node_became_unsynchronized(uid);
                if self.policy.mode().tracks_node_status() {
                    self.stats.on_status_changed(uid, NodeStatus::Offline);
                }
                self.stats.on_sync_state_changed(uid, SyncState::AwaitingResync);
                self.backoff(&mut node, res.as_ref().err()).await;
            }
            last_error = res.err();
        }

        if let Some(id) = node.conn_observer_id.take() {
            node.client.remove_connection_observer(id);
        }
        node.client.stop();
        self.queue.unregister_reader(node.reader);
        tracing::info!("[{}] {}:{} node routine finished", self.label(), self.server_id, uid);
    }

    /// Wait before retrying a failed node, failing its pending updates
    /// while it stays unreachable.
    async fn backoff(&self, node: &mut Node, err: Option<&ReplError>) {
        let Some(err) = err else {
            return;
        };
        let await_time = if err.is_ns_copying() {
            self.config.ns_copy_retry_interval
        } else {
            self.config.retry_sync_interval
        };
        let mut waited = Duration::ZERO;
        while waited < await_time && !self.terminator.is_set() {
            if err.is_timeout() {
                break;
            }
            if (err.is_network() || err.is_leader_changed())
                && self.handle_updates_with_error(node, err).await
            {
                break;
            }
            if !self.terminator.sleep(self.config.backoff_step).await {
                break;
            }
            waited += self.config.backoff_step;
        }
    }

    fn syncer(&self) -> NamespaceSyncer<'_, P> {
        NamespaceSyncer {
            server_id: self.server_id,
            config: &self.config,
            storage: self.storage.as_ref(),
            policy: self.policy.as_ref(),
            stats: &self.stats,
            terminator: &self.terminator,
            permits: self.sync_permits.as_ref(),
        }
    }

    async fn node_replication_impl(&self, node: &mut Node) -> Result<()> {
        let uid = node.uid;
        node.require_resync.store(false, Ordering::SeqCst);

        let opts = EnumNamespacesOpts::default()
            .only_names()
            .hide_system()
            .hide_temporary();
        let namespaces = match self.storage.enum_namespaces(opts).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                tracing::warn!(
                    "[{}] {}:{} unable to enum local namespaces: {}",
                    self.label(),
                    self.server_id,
                    uid,
                    e
                );
                return Err(e);
            }
        };

        let stamp = Lsn::new(self.server_id, 0);
        let previous = std::mem::take(&mut node.namespace_data);
        for (name, mut data) in previous {
            if let Some(tx) = data.tx.take() {
                let res = tx.rollback(stamp).await;
                tracing::info!(
                    "[{}] {}:{} rollback of transaction in '{}': {}",
                    self.label(),
                    self.server_id,
                    uid,
                    name,
                    match &res {
                        Ok(()) => "OK".to_string(),
                        Err(e) => format!("error: {}", e),
                    }
                );
            }
            if data.is_closed {
                data.requires_tm_update = true;
                node.namespace_data.insert(name, data);
            }
        }

        let targets: Vec<(String, bool)> = namespaces
            .into_iter()
            .filter(|def| self.policy.is_namespace_in_config(uid, &def.name))
            .map(|def| {
                let is_closed = node
                    .namespace_data
                    .get(&def.name)
                    .map_or(false, |data| data.is_closed);
                (def.name, is_closed)
            })
            .collect();
        tracing::info!(
            "[{}] {}:{} creating {} sync routines",
            self.label(),
            self.server_id,
            uid,
            targets.len()
        );

        let failure = Mutex::new(None);
        let syncer = self.syncer();
        let client = node.client.clone();
        let synced = join_all(targets.iter().map(|(ns, is_closed)| {
            let (syncer, client, failure) = (&syncer, client.as_ref(), &failure);
            async move {
                let latest = syncer
                    .sync_remote_namespace(uid, client, ns, *is_closed, failure)
                    .await;
                (ns.clone(), latest)
            }
        }))
        .await;

        if targets.is_empty() && self.policy.mode().awaits_cluster_role() {
            if let Err(e) = self.await_remote_cluster_role(uid, client.as_ref()).await {
                set_failure(&failure, e);
            }
        }

        if let Some(err) = failure.into_inner() {
            tracing::warn!(
                "[{}] {}:{} unable to sync remote namespaces: {}",
                self.label(),
                self.server_id,
                uid,
                err
            );
            return Err(err);
        }
        tracing::info!(
            "[{}] {}:{} all namespaces are synchronized",
            self.label(),
            self.server_id,
            uid
        );

        if self.policy.mode().tracks_node_status() {
            self.stats.on_status_changed(uid, NodeStatus::Online);
        }
        self.stats.on_sync_state_changed(uid, SyncState::OnlineReplication);
        for (ns, latest) in synced {
            if let Some(latest) = latest {
                node.namespace_data.entry(ns).or_default().latest_lsn = latest;
            }
        }

        self.updates_handling_loop(node).await.map(|_| ())
    }

    /// Wait for a node without replicated namespaces to accept this leader.
    async fn await_remote_cluster_role(
        &self,
        uid: NodeUid,
        client: &dyn ReplicationClient,
    ) -> Result<()> {
        let expected = ClusterizationStatus::cluster_replica(self.server_id);
        for _ in 0..self.config.max_role_switch_retries {
            let state = client.get_repl_state(None).await?;
            if !self.policy.is_leader() {
                return Err(leader_switched());
            }
            if state.cluster_status == expected {
                return Ok(());
            }
            tracing::trace!(
                "[{}] {}:{} awaiting role switch on remote node",
                self.label(),
                self.server_id,
                uid
            );
            if !self.terminator.sleep(self.config.role_switch_step).await {
                return Ok(());
            }
        }
        Err(ReplError::Timeout(format!(
            "{}:{} remote node did not switch its role",
            self.server_id, uid
        )))
    }

    /// Account completed batched updates. Returns the first failure.
    fn on_batched_done(
        &self,
        node: &mut Node,
        done: Vec<(BatchCtx, ApplyResult)>,
        require_reelection: &mut bool,
    ) -> ApplyResult {
        let first = first_error(&done);
        for (ctx, res) in done {
            let Some(upd) = ctx.block.get(ctx.offset) else {
                continue;
            };
            let rec = upd.record();
            if res.is_ok() {
                node.namespace_data
                    .entry(rec.ns_name.clone())
                    .or_default()
                    .update_lsn_on_record(rec);
            }
            let update_id = ctx.block.id() + ctx.offset as u64;
            tracing::trace!(
                "[{}] {}:{}:{} batched update {} (lsn {}) result: {}. Replicas: {}",
                self.label(),
                self.server_id,
                node.uid,
                rec.ns_name,
                update_id,
                rec.ext_lsn.lsn,
                match &res {
                    Ok(_) => "OK".to_string(),
                    Err(e) => format!("ERROR: {}", e),
                },
                upd.counters().replicas + 1
            );
            let decision = ctx.block.on_update_replicated(
                node.uid,
                self.consensus(),
                self.required(),
                ctx.offset,
                rec.emitter_server_id == node.server_id,
                res.as_ref().err(),
            );
            if res.is_ok() {
                self.policy.on_update_succeed(node.uid, update_id);
            }
            *require_reelection |= decision == ReplicationResult::Error;
        }
        first.map_or(Ok(Applied::Done), Err)
    }

    fn is_resync(&self, res: &ApplyResult) -> bool {
        matches!(res, Ok(Applied::Resync(kind)) if self.policy.requires_resync(*kind))
    }

    /// Stream live updates to a synced node.
    ///
    /// Returns `Ok` when the node has to be resynced and an error when
    /// replication to it failed.
    async fn updates_handling_loop(&self, node: &mut Node) -> ApplyResult {
        let uid = node.uid;
        let mode = self.policy.mode();
        tracing::info!(
            "[{}] {}:{} start updates handling loop",
            self.label(),
            self.server_id,
            uid
        );
        let mut batcher: UpdatesBatcher<BatchCtx> =
            UpdatesBatcher::new(self.config.batching_routines_count);
        let mut require_reelection = false;

        while !self.terminator.is_set() {
            loop {
                let mut res: ApplyResult = Ok(Applied::Done);
                if node.require_resync.load(Ordering::SeqCst) {
                    tracing::trace!(
                        "[{}] {}:{} node requires resync",
                        self.label(),
                        self.server_id,
                        uid
                    );
                    return Ok(Applied::Done);
                }
                if !self.policy.is_leader() {
                    tracing::trace!(
                        "[{}] {}:{} is not leader anymore",
                        self.label(),
                        self.server_id,
                        uid
                    );
                    return Ok(Applied::Done);
                }
                let Some(block) = self.queue.read(node.next_update_id, node.reader) else {
                    break;
                };
                if block.is_drop_block() {
                    let next = block.id() + 1;
                    tracing::info!(
                        "[{}] {}:{} got updates drop block, last id: {}, next id: {}",
                        self.label(),
                        self.server_id,
                        uid,
                        node.next_update_id,
                        next
                    );
                    node.next_update_id = next;
                    self.stats.on_update_applied(uid, block.id());
                    return Ok(Applied::Resync(ResyncKind::OnUpdatesDrop));
                }
                node.next_update_id = node.next_update_id.max(block.id());

                let mut offset = (node.next_update_id - block.id()) as usize;
                while offset < block.len() {
                    let current = offset;
                    offset += 1;
                    if block.is_invalidated() {
                        tracing::info!(
                            "[{}] {}:{} current update is invalidated",
                            self.label(),
                            self.server_id,
                            uid
                        );
                        break;
                    }
                    node.next_update_id += 1;
                    let Some(upd) = block.get(current) else {
                        break;
                    };
                    let rec = upd.record().clone();
                    let update_id = block.id() + current as u64;

                    if rec.is_network_check() {
                        let (_, check) = self
                            .handle_network_check_record(node, &block, current, true, &rec)
                            .await;
                        if check.is_err() {
                            res = check;
                            break;
                        }
                        continue;
                    }

                    let ns = rec.ns_name.as_str();
                    if mode.filters_live_updates() && !self.policy.is_namespace_in_config(uid, ns) {
                        block.on_update_replicated(
                            uid,
                            self.consensus(),
                            self.required(),
                            current,
                            false,
                            None,
                        );
                        self.policy.on_update_succeed(uid, update_id);
                        continue;
                    }

                    let ns_data = node.namespace_data.entry(ns.to_string()).or_default();
                    let outdated = !rec.ext_lsn.has_newer_counter_than(&ns_data.latest_lsn)
                        || ns_data.latest_lsn.is_empty();
                    if (!rec.is_db_record() && outdated) || rec.is_empty_record() {
                        tracing::trace!(
                            "[{}] {}:{}:{} skipping {} update {}, lsn {}, last synced {}",
                            self.label(),
                            self.server_id,
                            uid,
                            ns,
                            rec.kind.name(),
                            update_id,
                            rec.ext_lsn,
                            ns_data.latest_lsn
                        );
                        block.on_update_replicated(
                            uid,
                            self.consensus(),
                            self.required(),
                            current,
                            rec.emitter_server_id == node.server_id,
                            None,
                        );
                        continue;
                    }
                    if ns_data.tx.is_none() && rec.requires_tx() {
                        res = Err(ReplError::TxState(format!(
                            "update {} ({}, lsn {}) requires a transaction",
                            update_id,
                            rec.kind.name(),
                            rec.ext_lsn.lsn
                        )));
                        node.next_update_id -= 1;
                        break;
                    }
                    if ns_data.requires_tm_update
                        && (rec.is_batching_allowed() || rec.is_tx_beginning())
                    {
                        ns_data.requires_tm_update = false;
                        tracing::trace!(
                            "[{}] {}:{}:{} refreshing tags matcher",
                            self.label(),
                            self.server_id,
                            uid,
                            ns
                        );
                        if let Err(e) = node.client.refresh_tags_matcher(ns).await {
                            res = Err(e);
                            node.next_update_id -= 1;
                            break;
                        }
                    }

                    if rec.is_batching_allowed() {
                        let ctx = BatchCtx {
                            block: block.clone(),
                            offset: current,
                        };
                        let done = batcher
                            .batch(ctx, apply_stateless(node.client.clone(), rec.clone()))
                            .await;
                        // The submitted update is accounted when drained
                        res = self.on_batched_done(node, done, &mut require_reelection);
                        if res.is_err() {
                            break;
                        }
                        continue;
                    }

                    let done = batcher.await_batched_updates().await;
                    res = self.on_batched_done(node, done, &mut require_reelection);
                    if res.is_err() {
                        node.next_update_id -= 1;
                        break;
                    }

                    let ns_data = node.namespace_data.entry(ns.to_string()).or_default();
                    res = apply_update(node.client.as_ref(), self.server_id, mode, &rec, ns_data)
                        .await;
                    tracing::trace!(
                        "[{}] {}:{}:{} apply {} update {} (lsn {}) result: {}. Replicas: {}",
                        self.label(),
                        self.server_id,
                        uid,
                        ns,
                        rec.kind.name(),
                        update_id,
                        rec.ext_lsn.lsn,
                        match &res {
                            Ok(_) => "OK".to_string(),
                            Err(e) => format!("ERROR: {}", e),
                        },
                        upd.counters().replicas + 1
                    );
                    let decision = block.on_update_replicated(
                        uid,
                        self.consensus(),
                        self.required(),
                        current,
                        rec.emitter_server_id == node.server_id,
                        res.as_ref().err(),
                    );
                    match &res {
                        Ok(_) => {
                            ns_data.update_lsn_on_record(&rec);
                            ns_data.requires_tm_update = rec.requires_tm_update();
                            self.policy.on_update_succeed(uid, update_id);
                        }
                        Err(_) => {
                            require_reelection |= decision == ReplicationResult::Error;
                            // Re-read this update on the next iteration
                            node.next_update_id -= 1;
                            break;
                        }
                    }
                    if self.is_resync(&res) {
                        tracing::info!(
                            "[{}] {}:{} resync was requested",
                            self.label(),
                            self.server_id,
                            uid
                        );
                        break;
                    }
                }

                if batcher.batched_count() > 0 {
                    let done = batcher.await_batched_updates().await;
                    let batched = self.on_batched_done(node, done, &mut require_reelection);
                    if res.is_ok() {
                        res = batched;
                    }
                }

                if require_reelection {
                    tracing::warn!(
                        "[{}] {}:{} requesting leader reelection on error: {}",
                        self.label(),
                        self.server_id,
                        uid,
                        match &res {
                            Err(e) => e.to_string(),
                            Ok(_) => "none".to_string(),
                        }
                    );
                    self.policy.on_update_replication_failure();
                    return res;
                }
                if res.is_err() || self.is_resync(&res) {
                    return res;
                }
                if self.terminator.is_set() {
                    break;
                }
            }

            match node.update_notifier.try_recv() {
                Ok(()) => {}
                Err(TryRecvError::Empty) => {
                    self.policy
                        .on_all_updates_replicated(uid, node.next_update_id as i64 - 1);
                    tracing::trace!(
                        "[{}] {}:{} awaiting updates",
                        self.label(),
                        self.server_id,
                        uid
                    );
                    tokio::select! {
                        _ = node.update_notifier.recv() => {}
                        _ = self.terminator.wait() => {}
                    }
                }
                Err(TryRecvError::Disconnected) => self.terminator.wait().await,
            }
        }
        tracing::trace!(
            "[{}] {}: updates handling loop was terminated",
            self.label(),
            self.server_id
        );
        Ok(Applied::Done)
    }

    /// Acknowledge a network check record, probing the node when the
    /// record reports a state different from `currently_online`.
    ///
    /// Returns whether a probe ran and its result.
    async fn handle_network_check_record(
        &self,
        node: &Node,
        block: &UpdateBlock,
        offset: usize,
        currently_online: bool,
        rec: &UpdateRecord,
    ) -> (bool, ApplyResult) {
        let mut probed = false;
        let mut res = Ok(Applied::Done);
        if let RecordKind::NetworkCheck { node_uid, online } = rec.kind {
            if node_uid == node.uid && online != currently_online {
                res = node
                    .client
                    .status(self.config.status_timeout)
                    .await
                    .map(|_| Applied::Done);
                probed = true;
            }
        }
        block.on_update_replicated(
            node.uid,
            self.consensus(),
            self.required(),
            offset,
            false,
            None,
        );
        (probed, res)
    }

    /// Fail the updates queued for an unreachable node.
    ///
    /// Returns `true` when the node should be retried right away: it came
    /// back online, or it emitted one of the pending updates itself.
    async fn handle_updates_with_error(&self, node: &mut Node, err: &ReplError) -> bool {
        let uid = node.uid;
        let _ = node.update_notifier.try_recv();
        let mut reelection_requested = false;

        while !self.terminator.is_set() {
            let Some(block) = self.queue.read(node.next_update_id, node.reader) else {
                break;
            };
            if block.is_drop_block() {
                node.next_update_id = block.id() + 1;
                continue;
            }
            node.next_update_id = node.next_update_id.max(block.id());

            let mut offset = (node.next_update_id - block.id()) as usize;
            while offset < block.len() {
                let current = offset;
                offset += 1;
                node.next_update_id += 1;
                let Some(upd) = block.get(current) else {
                    break;
                };
                let rec = upd.record().clone();

                if rec.is_network_check() {
                    let (probed, res) = self
                        .handle_network_check_record(node, &block, current, false, &rec)
                        .await;
                    if probed && res.is_ok() {
                        return true;
                    }
                    continue;
                }
                let ns = rec.ns_name.as_str();
                if !self.policy.is_namespace_in_config(uid, ns) {
                    continue;
                }
                match rec.kind {
                    RecordKind::AddNamespace { .. } | RecordKind::DropNamespace => {
                        node.namespace_data.entry(ns.to_string()).or_default().is_closed = false;
                    }
                    RecordKind::CloseNamespace => {
                        node.namespace_data.entry(ns.to_string()).or_default().is_closed = true;
                    }
                    _ => {}
                }

                if block.is_invalidated() {
                    tracing::trace!(
                        "[{}] {}:{}:{} update {} was invalidated",
                        self.label(),
                        self.server_id,
                        uid,
                        ns,
                        block.id()
                    );
                    break;
                }
                if rec.emitter_server_id == node.server_id {
                    node.next_update_id -= 1;
                    return true;
                }

                let update_err = ReplError::ReplicationQuorum(format!(
                    "unable to send update to enough replicas; last error: {}",
                    err
                ));
                let decision = block.on_update_replicated(
                    uid,
                    self.consensus(),
                    self.required(),
                    current,
                    false,
                    Some(&update_err),
                );
                if decision == ReplicationResult::Error && !reelection_requested {
                    reelection_requested = true;
                    tracing::warn!(
                        "[{}] {}:{} requesting leader reelection on error: {}",
                        self.label(),
                        self.server_id,
                        uid,
                        err
                    );
                    self.policy.on_update_replication_failure();
                }
                let counters = upd.counters();
                tracing::trace!(
                    consensus = self.consensus(),
                    approvals = counters.approvals,
                    errors = counters.errors,
                    replicas = counters.replicas,
                    "[{}] {}:{}:{} dropping {} update (lsn {}, emitter {}) with error: {}",
                    self.label(),
                    self.server_id,
                    uid,
                    ns,
                    rec.kind.name(),
                    rec.ext_lsn,
                    rec.emitter_server_id,
                    err
                );
            }
        }
        false
    }
}

impl<P: BehaviorPolicy> Drop for ReplThread<P> {
    fn drop(&mut self) {
        self.queue.remove_data_notifier(self.reader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{InMemoryClient, InMemoryStorage};
    use crate::domain::entities::NamespaceDef;
    use crate::domain::value_objects::ExtendedLsn;
    use crate::replication::behavior::{AsyncThreadParam, NamespaceFilter, PermissionGate};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    const LEADER: ServerId = ServerId(1);

    struct Harness {
        leader: Arc<InMemoryStorage>,
        queue: Arc<UpdatesQueue>,
        thread: Arc<ReplThread<AsyncThreadParam>>,
    }

    fn harness() -> Harness {
        let queue = Arc::new(UpdatesQueue::new(1000));
        let leader = Arc::new(InMemoryStorage::new(LEADER));
        leader.attach_queue(queue.clone());
        let policy = AsyncThreadParam::new(
            Arc::new(NamespaceFilter::default()),
            HashMap::new(),
            PermissionGate::new(true),
            Arc::new(AtomicBool::new(false)),
        );
        let config = ReplThreadConfig::default()
            .retry_sync_interval(Duration::from_millis(50))
            .backoff_step(Duration::from_millis(10));
        let thread = Arc::new(ReplThread::new(
            LEADER,
            config,
            leader.clone(),
            queue.clone(),
            Arc::new(policy),
            ReplicationStatsCollector::new("async"),
        ));
        Harness { leader, queue, thread }
    }

    fn node(uid: NodeUid) -> (NodeConfig, Arc<InMemoryClient>) {
        let storage = Arc::new(InMemoryStorage::new(ServerId(10 + uid as i32)));
        (
            NodeConfig::new(uid, ServerId(10 + uid as i32), format!("mem://f{}", uid)),
            Arc::new(InMemoryClient::new(storage)),
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition was not reached in time");
    }

    #[tokio::test]
    async fn test_network_check_probe() {
        let h = harness();
        let (cfg, client) = node(0);
        let (_tx, rx) = mpsc::channel(1);
        let follower = Node::new(&cfg, client.clone(), rx);
        let handle = h.queue.push(vec![
            UpdateRecord::network_check(0, false),
            UpdateRecord::network_check(5, false),
        ]);
        let block = h.queue.read(handle.first_id(), h.thread.reader).unwrap();

        let (probed, res) = h
            .thread
            .handle_network_check_record(&follower, &block, 0, true, block.get(0).unwrap().record())
            .await;
        assert!(probed);
        assert!(res.is_ok());

        let (probed, _) = h
            .thread
            .handle_network_check_record(&follower, &block, 1, true, block.get(1).unwrap().record())
            .await;
        assert!(!probed);
        assert_eq!(client.call_count("status"), 1);
    }

    #[tokio::test]
    async fn test_updates_with_error_fail_pending_records() {
        let h = harness();
        h.thread.required.store(1, Ordering::SeqCst);
        h.thread.consensus.store(1, Ordering::SeqCst);
        let (cfg, client) = node(0);
        let (_tx, rx) = mpsc::channel(1);
        let mut follower = Node::new(&cfg, client, rx);

        h.leader.create_namespace(NamespaceDef::new("items")).unwrap();
        let handle = h.leader.upsert_item("items", r#"{"id":1}"#).unwrap().unwrap();
        let err = ReplError::Network("down".into());

        assert!(!h.thread.handle_updates_with_error(&mut follower, &err).await);
        assert_eq!(follower.next_update_id, h.queue.next_id());
        assert!(matches!(handle.wait().await, Err(ReplError::ReplicationQuorum(_))));
    }

    #[tokio::test]
    async fn test_updates_from_offline_emitter_retry_sync() {
        let h = harness();
        let (cfg, client) = node(0);
        let (_tx, rx) = mpsc::channel(1);
        let mut follower = Node::new(&cfg, client, rx);
        let rec = UpdateRecord::new(
            "items",
            ExtendedLsn::new(Lsn::new(LEADER, 1), Lsn::new(LEADER, 3)),
            cfg.server_id,
            RecordKind::Truncate,
        );
        let handle = h.queue.push(vec![rec]);
        let err = ReplError::Network("down".into());

        assert!(h.thread.handle_updates_with_error(&mut follower, &err).await);
        assert_eq!(follower.next_update_id, handle.first_id());
    }

    #[tokio::test]
    async fn test_run_replicates_and_terminates() {
        let h = harness();
        h.leader.create_namespace(NamespaceDef::new("items")).unwrap();
        h.leader.upsert_item("items", r#"{"id":1}"#).unwrap();
        let (cfg, client) = node(0);
        let follower = client.storage().clone();

        let join = h
            .thread
            .clone()
            .spawn(vec![(cfg, client.clone() as Arc<dyn ReplicationClient>)], 0, 1)
            .unwrap();

        eventually(|| follower.items("items").map(|i| i.len() == 1).unwrap_or(false)).await;
        h.leader.upsert_item("items", r#"{"id":2}"#).unwrap();
        eventually(|| follower.items("items").map(|i| i.len() == 2).unwrap_or(false)).await;

        h.thread.set_terminate(true);
        tokio::task::spawn_blocking(move || join.join()).await.unwrap().unwrap();
        assert_eq!(h.thread.terminator().active_routines(), 0);
        assert_eq!(client.observers_count(), 0);
    }
}
