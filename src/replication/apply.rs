//! Applying update records to a follower node.

use crate::domain::entities::{ClusterizationStatus, NsReplicationOpts};
use crate::domain::errors::ReplError;
use crate::domain::ports::{ClientTransaction, ReplicationClient};
use crate::domain::value_objects::{Lsn, ServerId};
use crate::replication::behavior::ReplMode;
use crate::replication::node::NamespaceData;
use crate::replication::types::{Applied, ApplyResult, RecordKind, ResyncKind, UpdateRecord};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Apply one record through the node's client.
///
/// `server_id` is the local (leader) server id. A panic inside the client
/// is reported as a logic error instead of unwinding into the node routine.
pub async fn apply_update(
    client: &dyn ReplicationClient,
    server_id: ServerId,
    mode: ReplMode,
    rec: &UpdateRecord,
    ns_data: &mut NamespaceData,
) -> ApplyResult {
    AssertUnwindSafe(apply_record(client, server_id, mode, rec, ns_data))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(ReplError::Logic(format!(
                "panic while applying {} to '{}'",
                rec.kind.name(),
                rec.ns_name
            )))
        })
}

/// Apply a batchable record. Needs no namespace state, so it can run
/// detached from the node routine.
pub async fn apply_stateless(
    client: Arc<dyn ReplicationClient>,
    rec: Arc<UpdateRecord>,
) -> ApplyResult {
    let lsn = rec.ext_lsn.lsn;
    match &rec.kind {
        RecordKind::Item { mode, item } => {
            client.modify_item(&rec.ns_name, *mode, item, lsn).await?;
        }
        RecordKind::PutMeta { key, value } => {
            client.put_meta(&rec.ns_name, key, value, lsn).await?;
        }
        other => {
            return Err(ReplError::Logic(format!("{} can not be batched", other.name())));
        }
    }
    Ok(Applied::Done)
}

fn open_tx<'a>(
    ns_data: &'a mut NamespaceData,
    rec: &UpdateRecord,
) -> Result<&'a mut Box<dyn ClientTransaction>, ReplError> {
    ns_data.tx.as_mut().ok_or_else(|| {
        ReplError::TxState(format!(
            "{} for '{}' requires an open transaction",
            rec.kind.name(),
            rec.ns_name
        ))
    })
}

async fn apply_record(
    client: &dyn ReplicationClient,
    server_id: ServerId,
    repl_mode: ReplMode,
    rec: &UpdateRecord,
    ns_data: &mut NamespaceData,
) -> ApplyResult {
    let ns = rec.ns_name.as_str();
    let lsn = rec.ext_lsn.lsn;

    match &rec.kind {
        RecordKind::Item { mode, item } => client.modify_item(ns, *mode, item, lsn).await?,
        RecordKind::ItemTx { mode, item } => {
            open_tx(ns_data, rec)?.modify_item(*mode, item, lsn).await?
        }
        RecordKind::IndexAdd(index) => client.add_index(ns, index, lsn).await?,
        RecordKind::IndexDrop(index) => client.drop_index(ns, index, lsn).await?,
        RecordKind::IndexUpdate(index) => client.update_index(ns, index, lsn).await?,
        RecordKind::PutMeta { key, value } => client.put_meta(ns, key, value, lsn).await?,
        RecordKind::PutMetaTx { key, value } => {
            open_tx(ns_data, rec)?.put_meta(key, value, lsn).await?
        }
        RecordKind::SetSchema(schema) => client.set_schema(ns, schema, lsn).await?,
        RecordKind::SetTagsMatcher(tm) => client.set_tags_matcher(ns, tm, lsn).await?,
        RecordKind::SetTagsMatcherTx(tm) => open_tx(ns_data, rec)?.set_tags_matcher(tm, lsn).await?,
        RecordKind::UpdateQuery(sql) => client.update_query(ns, sql, lsn).await?,
        RecordKind::DeleteQuery(sql) => client.delete_query(ns, sql, lsn).await?,
        RecordKind::UpdateQueryTx(sql) => {
            open_tx(ns_data, rec)?.modify_query(sql, false, lsn).await?
        }
        RecordKind::DeleteQueryTx(sql) => {
            open_tx(ns_data, rec)?.modify_query(sql, true, lsn).await?
        }
        RecordKind::Truncate => client.truncate_namespace(ns, lsn).await?,
        RecordKind::BeginTx => {
            if ns_data.tx.is_some() {
                return Err(ReplError::TxState(format!("transaction for '{}' is already open", ns)));
            }
            ns_data.tx = Some(client.begin_transaction(ns, lsn).await?);
        }
        RecordKind::CommitTx => {
            let tx = ns_data.tx.take().ok_or_else(|| {
                ReplError::TxState(format!("CommitTx for '{}' requires an open transaction", ns))
            })?;
            tx.commit(lsn).await?;
        }
        RecordKind::AddNamespace { def, state_token } => {
            let ns_version = rec.ext_lsn.ns_version;
            let opts = NsReplicationOpts {
                state_token: *state_token,
                ns_version,
            };
            let res = client
                .add_namespace(def, opts, Lsn::new(ns_version.server, 0))
                .await;
            if res.is_ok() && ns_data.is_closed {
                ns_data.is_closed = false;
                tracing::trace!("namespace '{}' was reopened on leader, scheduling resync", ns);
                return Ok(Applied::Resync(ResyncKind::Generic));
            }
            ns_data.is_closed = false;
            res?;
            if repl_mode.assigns_simple_replica() {
                client
                    .set_clusterization_status(ns, ClusterizationStatus::simple_replica(server_id))
                    .await?;
            }
        }
        RecordKind::DropNamespace => {
            let res = client.drop_namespace(ns, lsn.with_server(server_id)).await;
            ns_data.is_closed = false;
            match res {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        RecordKind::CloseNamespace => {
            ns_data.is_closed = true;
            tracing::trace!("namespace '{}' was closed on leader", ns);
        }
        RecordKind::RenameNamespace { dst } => {
            tracing::warn!(
                "rename of '{}' to '{}' can not be replicated, scheduling resync",
                ns,
                dst
            );
            return Ok(Applied::Resync(ResyncKind::Generic));
        }
        RecordKind::Resync(kind) => return Ok(Applied::Resync(*kind)),
        RecordKind::NetworkCheck { .. } | RecordKind::Empty => {}
    }
    Ok(Applied::Done)
}
