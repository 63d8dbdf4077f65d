//! Follower node session state.

use crate::domain::ports::{ClientTransaction, ObserverId, ReplicationClient};
use crate::domain::value_objects::{ExtendedLsn, NodeUid, ServerId};
use crate::replication::config::NodeConfig;
use crate::replication::queue::ReaderKey;
use crate::replication::types::{RecordKind, UpdateRecord};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-(node, namespace) replication progress.
#[derive(Default)]
pub struct NamespaceData {
    /// Last watermark confirmed on the node.
    pub latest_lsn: ExtendedLsn,
    /// Namespace was closed on the leader.
    pub is_closed: bool,
    /// Tags matcher must be refreshed before the next batchable update.
    pub requires_tm_update: bool,
    /// Transaction opened on the node by a `BeginTx` record.
    pub tx: Option<Box<dyn ClientTransaction>>,
}

impl NamespaceData {
    /// Advance the watermark after `rec` was applied.
    pub fn update_lsn_on_record(&mut self, rec: &UpdateRecord) {
        match rec.kind {
            RecordKind::DropNamespace => self.latest_lsn = ExtendedLsn::default(),
            // Re-adding a namespace that is already synced keeps its watermark
            RecordKind::AddNamespace { .. } => {
                if rec.ext_lsn.ns_version != self.latest_lsn.ns_version {
                    self.latest_lsn = rec.ext_lsn;
                }
            }
            RecordKind::CloseNamespace
            | RecordKind::RenameNamespace { .. }
            | RecordKind::Resync(_)
            | RecordKind::NetworkCheck { .. }
            | RecordKind::Empty => {}
            // Batched updates complete out of order
            _ => {
                if !rec.ext_lsn.is_compatible_by_ns_version(&self.latest_lsn)
                    || rec.ext_lsn.has_newer_counter_than(&self.latest_lsn)
                {
                    self.latest_lsn = rec.ext_lsn;
                }
            }
        }
    }
}

/// Session with one follower, owned by its node routine.
pub struct Node {
    pub uid: NodeUid,
    pub server_id: ServerId,
    pub dsn: String,
    pub client: Arc<dyn ReplicationClient>,
    pub namespace_data: HashMap<String, NamespaceData>,
    /// Identity of this node's position in the updates queue.
    pub reader: ReaderKey,
    pub next_update_id: u64,
    pub conn_observer_id: Option<ObserverId>,
    /// Set from outside the routine to force a full resync.
    pub require_resync: Arc<AtomicBool>,
    /// Coalesced "new updates" notifications.
    pub update_notifier: mpsc::Receiver<()>,
}

impl Node {
    pub fn new(
        config: &NodeConfig,
        client: Arc<dyn ReplicationClient>,
        update_notifier: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            uid: config.uid,
            server_id: config.server_id,
            dsn: config.dsn.clone(),
            client,
            namespace_data: HashMap::new(),
            reader: ReaderKey::next(),
            next_update_id: 0,
            conn_observer_id: None,
            require_resync: Arc::new(AtomicBool::new(false)),
            update_notifier,
        }
    }

    /// Drop the current session and connect again.
    pub async fn reconnect(&mut self) {
        self.client.stop();
        if let Err(e) = self.client.connect(&self.dsn).await {
            tracing::debug!("node {} ({}) connect failed: {}", self.uid, self.dsn, e);
        }
    }
}
