//! Namespace Syncer
//!
//! Brings one follower namespace up to the leader's state before live
//! replication starts. The follower's watermark decides between replaying
//! the WAL tail into the namespace in place and a forced sync, where a raw
//! snapshot is loaded into a temporary namespace that atomically replaces
//! the target on success.

use crate::domain::entities::{ClusterizationStatus, ReplicationState, SnapshotOpts};
use crate::domain::errors::{ReplError, Result};
use crate::domain::ports::{ReplicationClient, StorageEngine};
use crate::domain::value_objects::{ExtendedLsn, Lsn, NodeUid, ServerId};
use crate::infrastructure::Terminator;
use crate::replication::behavior::BehaviorPolicy;
use crate::replication::config::ReplThreadConfig;
use crate::replication::stats::{NodeStatus, ReplicationStatsCollector, SyncKind, SyncState};
use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::Semaphore;

pub(crate) fn leader_switched() -> ReplError {
    ReplError::LeaderChanged("leader was switched".into())
}

/// Record `err` unless an earlier failure is already stored.
pub(crate) fn set_failure(failure: &Mutex<Option<ReplError>>, err: ReplError) {
    let mut failure = failure.lock();
    if failure.is_none() {
        *failure = Some(err);
    }
}

/// Borrowed view of a replication thread used to sync namespaces.
pub struct NamespaceSyncer<'a, P> {
    pub server_id: ServerId,
    pub config: &'a ReplThreadConfig,
    pub storage: &'a dyn StorageEngine,
    pub policy: &'a P,
    pub stats: &'a ReplicationStatsCollector,
    pub terminator: &'a Terminator,
    pub permits: Option<&'a Semaphore>,
}

impl<'a, P: BehaviorPolicy> NamespaceSyncer<'a, P> {
    fn label(&self) -> &'static str {
        self.policy.mode().label()
    }

    /// Run a remote call under the sync timeout.
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.sync_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ReplError::Timeout(format!(
                "no answer from node in {:?}",
                self.config.sync_timeout
            ))),
        }
    }

    /// Sync `ns` on one node, retrying while the node switches its role.
    ///
    /// Returns the watermark reached on the node. Failures are stored in
    /// `failure`, shared by every namespace routine of the node; once it
    /// holds an error the remaining routines give up.
    pub async fn sync_remote_namespace(
        &self,
        uid: NodeUid,
        client: &dyn ReplicationClient,
        ns: &str,
        is_closed: bool,
        failure: &Mutex<Option<ReplError>>,
    ) -> Option<ExtendedLsn> {
        let mode = self.policy.mode();
        for _ in 0..self.config.max_role_switch_retries {
            let mut ns_exists = true;
            let mut state = self.call(client.get_repl_state(Some(ns))).await;
            if matches!(&state, Err(e) if e.is_not_found()) {
                ns_exists = false;
                tracing::info!(
                    "[{}] {}:{} namespace '{}' is missing on remote node, reading database state",
                    self.label(),
                    self.server_id,
                    uid,
                    ns
                );
                state = self.call(client.get_repl_state(None)).await;
            }

            {
                let mut failure = failure.lock();
                if !self.policy.is_leader() {
                    if failure.is_none() {
                        *failure = Some(leader_switched());
                    }
                    return None;
                }
                if failure.is_some() {
                    return None;
                }
            }

            let state = match state {
                Ok(state) => {
                    self.stats.on_sync_state_changed(uid, SyncState::Syncing);
                    if mode.tracks_node_status() {
                        self.stats.on_status_changed(uid, NodeStatus::Online);
                    }
                    if mode.awaits_cluster_role() {
                        let expected = ClusterizationStatus::cluster_replica(self.server_id);
                        if state.cluster_status != expected {
                            tracing::trace!(
                                "[{}] {}:{} awaiting role switch for '{}' on remote node",
                                self.label(),
                                self.server_id,
                                uid,
                                ns
                            );
                            if !self.terminator.sleep(self.config.role_switch_step).await {
                                return None;
                            }
                            continue;
                        }
                        Ok(state)
                    } else if ns_exists
                        && state.cluster_status
                            != ClusterizationStatus::simple_replica(self.server_id)
                    {
                        tracing::trace!(
                            "[{}] {}:{} switching role for '{}' on remote node",
                            self.label(),
                            self.server_id,
                            uid,
                            ns
                        );
                        let status = ClusterizationStatus::simple_replica(self.server_id);
                        self.call(client.set_clusterization_status(ns, status))
                            .await
                            .map(|_| state)
                    } else {
                        Ok(state)
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "[{}] {}:{} unable to get repl state: {}",
                        self.label(),
                        self.server_id,
                        uid,
                        e
                    );
                    Err(e)
                }
            };

            let outcome = match state {
                Ok(state) => {
                    let follower = if ns_exists { state } else { ReplicationState::default() };
                    self.sync_with_recovery(uid, client, ns, &follower, is_closed).await
                }
                Err(e) => Err(e),
            };
            return match outcome {
                Ok(latest) => latest,
                Err(e) => {
                    set_failure(failure, e);
                    None
                }
            };
        }

        set_failure(
            failure,
            ReplError::Timeout(format!(
                "{}:{} unable to sync namespace '{}'",
                self.server_id, uid, ns
            )),
        );
        None
    }

    async fn sync_with_recovery(
        &self,
        uid: NodeUid,
        client: &dyn ReplicationClient,
        ns: &str,
        follower: &ReplicationState,
        is_closed: bool,
    ) -> Result<Option<ExtendedLsn>> {
        match self.sync_namespace(uid, client, ns, follower, is_closed).await {
            Ok(latest) => Ok(latest),
            Err(e) if e.is_not_found() => {
                tracing::warn!(
                    "[{}] {}:{} namespace sync error: {}. Expecting drop namespace record for '{}'",
                    self.label(),
                    self.server_id,
                    uid,
                    e,
                    ns
                );
                Ok(None)
            }
            Err(ReplError::DataHashMismatch(msg)) => {
                tracing::warn!(
                    "[{}] {}:{} data hash mismatch: {}. Retrying with full sync",
                    self.label(),
                    self.server_id,
                    uid,
                    msg
                );
                self.sync_namespace(uid, client, ns, &ReplicationState::default(), is_closed)
                    .await
                    .map_err(|e| {
                        tracing::warn!(
                            "[{}] {}:{} namespace sync error after full resync: {}",
                            self.label(),
                            self.server_id,
                            uid,
                            e
                        );
                        e
                    })
            }
            Err(e) => {
                tracing::warn!(
                    "[{}] {}:{} namespace sync error: {}",
                    self.label(),
                    self.server_id,
                    uid,
                    e
                );
                Err(e)
            }
        }
    }

    /// Transfer `ns` to the node, given the node's current state of it.
    ///
    /// Returns `None` when nothing was synced (namespace absent on both
    /// sides, closed on the leader, or the thread was terminated).
    pub async fn sync_namespace(
        &self,
        uid: NodeUid,
        client: &dyn ReplicationClient,
        ns: &str,
        follower: &ReplicationState,
        is_closed: bool,
    ) -> Result<Option<ExtendedLsn>> {
        let _permit = match self.permits {
            Some(permits) => {
                tracing::trace!(
                    "[{}] {}:{}:{} awaiting sync token",
                    self.label(),
                    self.server_id,
                    uid,
                    ns
                );
                Some(permits.acquire().await.map_err(|_| ReplError::Terminated)?)
            }
            None => None,
        };
        if !self.policy.is_leader() {
            return Err(leader_switched());
        }
        let mut timer = self.stats.sync_timer(SyncKind::WalSync);
        let stamp = Lsn::new(self.server_id, 0);
        let mut required = follower.extended_lsn();

        let local = match self.storage.get_repl_state(ns).await {
            Ok(local) => local,
            Err(e) if e.is_not_found() => {
                if required.is_empty() {
                    tracing::info!(
                        "[{}] {}:{} namespace '{}' does not exist on both follower and leader",
                        self.label(),
                        self.server_id,
                        uid,
                        ns
                    );
                    return Ok(None);
                }
                if is_closed {
                    tracing::info!(
                        "[{}] {}:{} namespace '{}' is closed on leader, skipping it",
                        self.label(),
                        self.server_id,
                        uid,
                        ns
                    );
                    return Ok(None);
                }
                tracing::info!(
                    "[{}] {}:{} namespace '{}' exists on follower only. Removing it",
                    self.label(),
                    self.server_id,
                    uid,
                    ns
                );
                if let Err(drop_err) = self.call(client.drop_namespace(ns, stamp)).await {
                    tracing::info!(
                        "[{}] {}:{} unable to remove namespace '{}': {}",
                        self.label(),
                        self.server_id,
                        uid,
                        ns,
                        drop_err
                    );
                    return Err(drop_err);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let local_lsn = local.extended_lsn();

        tracing::info!(
            "[{}] {}:{} repl state for '{}': local {} data_hash {}, remote {} data_hash {}",
            self.label(),
            self.server_id,
            uid,
            ns,
            local_lsn,
            local.data_hash,
            required,
            follower.data_hash
        );

        if !required.is_empty() && local_lsn.is_compatible_by_ns_version(&required) {
            if required.lsn.counter > local_lsn.lsn.counter {
                tracing::warn!(
                    "[{}] {}:{}:{} unexpected follower lsn {}, local lsn {}",
                    self.label(),
                    self.server_id,
                    uid,
                    ns,
                    required.lsn,
                    local_lsn.lsn
                );
                required = ExtendedLsn::default();
            } else if required.lsn.counter == local.last_lsn.counter
                && required.lsn.server != local.last_lsn.server
            {
                tracing::warn!(
                    "[{}] {}:{}:{} unexpected follower lsn {}, local lsn {}: server ids differ",
                    self.label(),
                    self.server_id,
                    uid,
                    ns,
                    required.lsn,
                    local_lsn.lsn
                );
                required = ExtendedLsn::default();
            } else if required.lsn == local_lsn.lsn && follower.data_hash != local.data_hash {
                tracing::warn!(
                    "[{}] {}:{}:{} data hash mismatch: expected {}, actual {}",
                    self.label(),
                    self.server_id,
                    uid,
                    ns,
                    local.data_hash,
                    follower.data_hash
                );
                required = ExtendedLsn::default();
            }
        }

        let opts = SnapshotOpts {
            from: required,
            max_wal_depth: self.config.max_wal_depth_on_force_sync,
        };
        let snapshot = self.storage.get_snapshot(ns, opts).await?;
        let force = if snapshot.has_raw_data {
            tracing::info!(
                "[{}] {}:{}:{} snapshot has raw data, creating tmp namespace",
                self.label(),
                self.server_id,
                uid,
                ns
            );
            true
        } else if snapshot.ns_version != required.ns_version {
            tracing::info!(
                "[{}] {}:{}:{} ns version differs ({} vs {}), creating tmp namespace",
                self.label(),
                self.server_id,
                uid,
                ns,
                snapshot.ns_version,
                required.ns_version
            );
            true
        } else {
            false
        };

        let mut tmp_ns = None;
        let transferred = self
            .transfer(uid, client, ns, &snapshot, force, stamp, &mut tmp_ns, &mut timer)
            .await;
        if let Some(tmp) = tmp_ns {
            tracing::warn!(
                "[{}] {}: removing tmp namespace '{}' on error",
                self.label(),
                self.server_id,
                tmp
            );
            if let Err(e) = self.call(client.drop_namespace(&tmp, stamp)).await {
                tracing::debug!(
                    "[{}] {}: unable to remove '{}': {}",
                    self.label(),
                    self.server_id,
                    tmp,
                    e
                );
            }
        }
        if !transferred? {
            return Ok(None);
        }

        let remote = match self.call(client.get_repl_state(Some(ns))).await {
            Ok(remote) => remote,
            Err(e) if e.is_not_found() => ReplicationState::default(),
            Err(e) => return Err(e),
        };
        let expected = ExtendedLsn::new(snapshot.ns_version, snapshot.last_lsn);
        tracing::info!(
            "[{}] {}:{}:{} sync done: snapshot {} data_hash {}, remote {} data_hash {}",
            self.label(),
            self.server_id,
            uid,
            ns,
            expected,
            snapshot.expected_data_hash,
            remote.extended_lsn(),
            remote.data_hash
        );

        let mismatch = (!snapshot.last_lsn.is_empty() && snapshot.last_lsn != remote.last_lsn)
            || (!snapshot.ns_version.is_empty() && snapshot.ns_version != remote.ns_version);
        if mismatch || snapshot.expected_data_hash != remote.data_hash {
            return Err(ReplError::DataHashMismatch(format!(
                "{}:{}:{}: actual {} data_hash {}; expected {} data_hash {}",
                self.server_id,
                uid,
                ns,
                remote.extended_lsn(),
                remote.data_hash,
                expected,
                snapshot.expected_data_hash
            )));
        }
        Ok(Some(remote.extended_lsn()))
    }

    /// Apply snapshot chunks. Returns `false` when interrupted by
    /// termination. `tmp_ns` holds the temporary namespace until it has
    /// replaced the target.
    #[allow(clippy::too_many_arguments)]
    async fn transfer(
        &self,
        uid: NodeUid,
        client: &dyn ReplicationClient,
        ns: &str,
        snapshot: &crate::domain::entities::Snapshot,
        force: bool,
        stamp: Lsn,
        tmp_ns: &mut Option<String>,
        timer: &mut crate::replication::stats::SyncTimeCounter,
    ) -> Result<bool> {
        let target = if force {
            timer.set_kind(SyncKind::ForceSync);
            let tmp = self
                .call(client.create_temporary_namespace(ns, snapshot.ns_version, stamp))
                .await?;
            *tmp_ns = Some(tmp.clone());
            if self.policy.mode().assigns_simple_replica() {
                let status = ClusterizationStatus::simple_replica(self.server_id);
                self.call(client.set_clusterization_status(&tmp, status)).await?;
            }
            tmp
        } else {
            ns.to_string()
        };
        tracing::info!(
            "[{}] {}:{}:{} target ns name: {}",
            self.label(),
            self.server_id,
            uid,
            ns,
            target
        );

        for chunk in &snapshot.chunks {
            if self.terminator.is_set() {
                tracing::info!(
                    "[{}] {}:{}:{} terminated while syncing namespace",
                    self.label(),
                    self.server_id,
                    uid,
                    ns
                );
                return Ok(false);
            }
            if !self.policy.is_leader() {
                return Err(leader_switched());
            }
            self.call(client.apply_snapshot_chunk(&target, chunk, stamp)).await?;
        }

        if force {
            tracing::trace!(
                "[{}] {}:{}:{} renaming {} -> {}",
                self.label(),
                self.server_id,
                uid,
                ns,
                target,
                ns
            );
            self.call(client.rename_namespace(&target, ns, stamp)).await?;
            *tmp_ns = None;
        }
        Ok(true)
    }
}
