//! Replication Types
//!
//! Update records flowing from the storage engine to follower nodes.

use crate::domain::entities::{IndexDef, ItemModifyMode, NamespaceDef, TagsMatcher};
use crate::domain::errors::ReplError;
use crate::domain::value_objects::{ExtendedLsn, NodeUid, ServerId};
use bytes::Bytes;

/// Reason a full resync of a node was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResyncKind {
    Generic,
    /// Leader was (re)initialized.
    LeaderInit,
    /// Reader fell behind the retained part of the updates queue.
    OnUpdatesDrop,
}

/// Payload of an update record, one case per record kind.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    Item { mode: ItemModifyMode, item: Bytes },
    ItemTx { mode: ItemModifyMode, item: Bytes },
    IndexAdd(IndexDef),
    IndexDrop(IndexDef),
    IndexUpdate(IndexDef),
    PutMeta { key: String, value: String },
    PutMetaTx { key: String, value: String },
    SetSchema(String),
    SetTagsMatcher(TagsMatcher),
    SetTagsMatcherTx(TagsMatcher),
    UpdateQuery(String),
    DeleteQuery(String),
    UpdateQueryTx(String),
    DeleteQueryTx(String),
    Truncate,
    BeginTx,
    CommitTx,
    AddNamespace { def: NamespaceDef, state_token: Option<i32> },
    DropNamespace,
    CloseNamespace,
    RenameNamespace { dst: String },
    Resync(ResyncKind),
    NetworkCheck { node_uid: NodeUid, online: bool },
    Empty,
}

impl RecordKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Item { mode, .. } => match mode {
                ItemModifyMode::Insert => "ItemInsert",
                ItemModifyMode::Update => "ItemUpdate",
                ItemModifyMode::Upsert => "ItemUpsert",
                ItemModifyMode::Delete => "ItemDelete",
            },
            Self::ItemTx { mode, .. } => match mode {
                ItemModifyMode::Insert => "ItemInsertTx",
                ItemModifyMode::Update => "ItemUpdateTx",
                ItemModifyMode::Upsert => "ItemUpsertTx",
                ItemModifyMode::Delete => "ItemDeleteTx",
            },
            Self::IndexAdd(_) => "IndexAdd",
            Self::IndexDrop(_) => "IndexDrop",
            Self::IndexUpdate(_) => "IndexUpdate",
            Self::PutMeta { .. } => "PutMeta",
            Self::PutMetaTx { .. } => "PutMetaTx",
            Self::SetSchema(_) => "SetSchema",
            Self::SetTagsMatcher(_) => "SetTagsMatcher",
            Self::SetTagsMatcherTx(_) => "SetTagsMatcherTx",
            Self::UpdateQuery(_) => "UpdateQuery",
            Self::DeleteQuery(_) => "DeleteQuery",
            Self::UpdateQueryTx(_) => "UpdateQueryTx",
            Self::DeleteQueryTx(_) => "DeleteQueryTx",
            Self::Truncate => "Truncate",
            Self::BeginTx => "BeginTx",
            Self::CommitTx => "CommitTx",
            Self::AddNamespace { .. } => "AddNamespace",
            Self::DropNamespace => "DropNamespace",
            Self::CloseNamespace => "CloseNamespace",
            Self::RenameNamespace { .. } => "RenameNamespace",
            Self::Resync(ResyncKind::Generic) => "ResyncNamespaceGeneric",
            Self::Resync(ResyncKind::LeaderInit) => "ResyncNamespaceLeaderInit",
            Self::Resync(ResyncKind::OnUpdatesDrop) => "ResyncOnUpdatesDrop",
            Self::NetworkCheck { .. } => "NodeNetworkCheck",
            Self::Empty => "Empty",
        }
    }
}

/// Atomic unit of replicated change.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
    pub ns_name: String,
    pub ext_lsn: ExtendedLsn,
    pub emitter_server_id: ServerId,
    pub kind: RecordKind,
}

impl UpdateRecord {
    pub fn new(
        ns_name: impl Into<String>,
        ext_lsn: ExtendedLsn,
        emitter_server_id: ServerId,
        kind: RecordKind,
    ) -> Self {
        Self {
            ns_name: ns_name.into(),
            ext_lsn,
            emitter_server_id,
            kind,
        }
    }

    /// Record telling the replicators to re-check a node's connection.
    pub fn network_check(node_uid: NodeUid, online: bool) -> Self {
        Self {
            ns_name: String::new(),
            ext_lsn: ExtendedLsn::default(),
            emitter_server_id: ServerId::default(),
            kind: RecordKind::NetworkCheck { node_uid, online },
        }
    }

    /// Namespace lifecycle records, applied regardless of LSN ordering.
    pub fn is_db_record(&self) -> bool {
        matches!(
            self.kind,
            RecordKind::AddNamespace { .. }
                | RecordKind::DropNamespace
                | RecordKind::CloseNamespace
                | RecordKind::RenameNamespace { .. }
                | RecordKind::Resync(ResyncKind::Generic)
                | RecordKind::Resync(ResyncKind::LeaderInit)
        )
    }

    pub fn is_empty_record(&self) -> bool {
        matches!(self.kind, RecordKind::Empty)
    }

    pub fn is_network_check(&self) -> bool {
        matches!(self.kind, RecordKind::NetworkCheck { .. })
    }

    pub fn requires_tx(&self) -> bool {
        matches!(
            self.kind,
            RecordKind::ItemTx { .. }
                | RecordKind::PutMetaTx { .. }
                | RecordKind::SetTagsMatcherTx(_)
                | RecordKind::UpdateQueryTx(_)
                | RecordKind::DeleteQueryTx(_)
                | RecordKind::CommitTx
        )
    }

    pub fn is_tx_beginning(&self) -> bool {
        matches!(self.kind, RecordKind::BeginTx)
    }

    /// Records that may be applied concurrently with their neighbours.
    pub fn is_batching_allowed(&self) -> bool {
        matches!(self.kind, RecordKind::Item { .. } | RecordKind::PutMeta { .. })
    }

    /// Records after which the follower's tags matcher may be stale.
    pub fn requires_tm_update(&self) -> bool {
        matches!(
            self.kind,
            RecordKind::IndexAdd(_)
                | RecordKind::IndexDrop(_)
                | RecordKind::IndexUpdate(_)
                | RecordKind::SetSchema(_)
                | RecordKind::AddNamespace { .. }
                | RecordKind::CommitTx
                | RecordKind::SetTagsMatcher(_)
        )
    }
}

/// Outcome of applying a single record to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Done,
    /// Record applied (or ignored) but the node must be fully resynced.
    Resync(ResyncKind),
}

pub type ApplyResult = Result<Applied, ReplError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::Lsn;

    fn rec(kind: RecordKind) -> UpdateRecord {
        let lsn = ExtendedLsn::new(Lsn::new(ServerId(1), 1), Lsn::new(ServerId(1), 5));
        UpdateRecord::new("items", lsn, ServerId(1), kind)
    }

    #[test]
    fn test_db_records() {
        assert!(rec(RecordKind::DropNamespace).is_db_record());
        assert!(rec(RecordKind::Resync(ResyncKind::Generic)).is_db_record());
        assert!(!rec(RecordKind::Resync(ResyncKind::OnUpdatesDrop)).is_db_record());
        assert!(!rec(RecordKind::Truncate).is_db_record());
    }

    #[test]
    fn test_tx_predicates() {
        let item = Bytes::from_static(b"{\"id\":1}");
        let tx_item = RecordKind::ItemTx {
            mode: ItemModifyMode::Upsert,
            item: item.clone(),
        };
        assert!(rec(tx_item).requires_tx());
        assert!(rec(RecordKind::CommitTx).requires_tx());
        assert!(!rec(RecordKind::BeginTx).requires_tx());
        assert!(rec(RecordKind::BeginTx).is_tx_beginning());
        assert!(!rec(RecordKind::Item { mode: ItemModifyMode::Upsert, item }).requires_tx());
    }

    #[test]
    fn test_batching() {
        let item = Bytes::from_static(b"{\"id\":1}");
        let delete = RecordKind::Item {
            mode: ItemModifyMode::Delete,
            item: item.clone(),
        };
        let meta = RecordKind::PutMeta {
            key: "k".into(),
            value: "v".into(),
        };
        let tx_delete = RecordKind::ItemTx {
            mode: ItemModifyMode::Delete,
            item,
        };
        assert!(rec(delete).is_batching_allowed());
        assert!(rec(meta).is_batching_allowed());
        assert!(!rec(tx_delete).is_batching_allowed());
        assert!(!rec(RecordKind::IndexAdd(IndexDef::default())).is_batching_allowed());
    }

    #[test]
    fn test_tm_update() {
        assert!(rec(RecordKind::IndexAdd(IndexDef::default())).requires_tm_update());
        assert!(rec(RecordKind::CommitTx).requires_tm_update());
        assert!(!rec(RecordKind::Truncate).requires_tm_update());
    }

    #[test]
    fn test_network_check_record() {
        let r = UpdateRecord::network_check(3, false);
        assert!(r.is_network_check());
        assert_eq!(r.kind.name(), "NodeNetworkCheck");
        assert!(!r.is_db_record());
    }
}
