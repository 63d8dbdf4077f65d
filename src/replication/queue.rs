//! Updates Queue
//!
//! Bounded, shared, multi-reader log of update records with per-record
//! quorum accounting. The storage engine pushes blocks of records; every
//! replication thread reads them by absolute id and reports the outcome
//! for each of its nodes back into the record counters.

use crate::domain::errors::{ReplError, Result};
use crate::domain::value_objects::NodeUid;
use crate::replication::types::UpdateRecord;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Stable identity of a queue reader (one per replication thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderKey(pub u64);

impl ReaderKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Decision reported by [`UpdateBlock::on_update_replicated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationResult {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCounters {
    pub approvals: usize,
    pub errors: usize,
    pub replicas: usize,
}

const STATUS_PENDING: u8 = 0;
const STATUS_SUCCESS: u8 = 1;
const STATUS_ERROR: u8 = 2;

#[derive(Default)]
struct Acks {
    approvals: usize,
    errors: usize,
    /// Latest outcome per node, `true` for an approval.
    nodes: Vec<(NodeUid, bool)>,
}

impl Acks {
    /// Account one node's outcome. A node is counted once; a later
    /// approval replaces its earlier error.
    fn add(&mut self, node: NodeUid, approved: bool) {
        match self.nodes.iter_mut().find(|(uid, _)| *uid == node) {
            Some((_, prev)) => {
                if approved && !*prev {
                    *prev = true;
                    self.errors -= 1;
                    self.approvals += 1;
                }
            }
            None => {
                self.nodes.push((node, approved));
                if approved {
                    self.approvals += 1;
                } else {
                    self.errors += 1;
                }
            }
        }
    }
}

/// A record plus its acknowledgment counters.
pub struct QueuedUpdate {
    record: Arc<UpdateRecord>,
    acks: Mutex<Acks>,
    status: AtomicU8,
}

impl QueuedUpdate {
    fn new(record: UpdateRecord) -> Self {
        Self {
            record: Arc::new(record),
            acks: Mutex::new(Acks::default()),
            status: AtomicU8::new(STATUS_PENDING),
        }
    }

    pub fn record(&self) -> &Arc<UpdateRecord> {
        &self.record
    }

    pub fn counters(&self) -> UpdateCounters {
        let acks = self.acks.lock();
        UpdateCounters {
            approvals: acks.approvals,
            errors: acks.errors,
            replicas: acks.nodes.len(),
        }
    }

    pub fn status(&self) -> ReplicationResult {
        match self.status.load(Ordering::SeqCst) {
            STATUS_SUCCESS => ReplicationResult::Success,
            STATUS_ERROR => ReplicationResult::Error,
            _ => ReplicationResult::Pending,
        }
    }

    fn decide(&self, verdict: u8) -> bool {
        self.status
            .compare_exchange(STATUS_PENDING, verdict, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_decided(&self) -> bool {
        self.status.load(Ordering::SeqCst) != STATUS_PENDING
    }
}

/// Records pushed together, sharing a contiguous id range.
pub struct UpdateBlock {
    id: u64,
    drop_block: bool,
    invalidated: AtomicBool,
    updates: Vec<QueuedUpdate>,
    decided: AtomicUsize,
    failed: AtomicBool,
    done: watch::Sender<bool>,
}

impl UpdateBlock {
    fn new(id: u64, records: Vec<UpdateRecord>) -> Self {
        let updates: Vec<QueuedUpdate> = records.into_iter().map(QueuedUpdate::new).collect();
        let (done, _) = watch::channel(updates.is_empty());
        Self {
            id,
            drop_block: false,
            invalidated: AtomicBool::new(false),
            updates,
            decided: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            done,
        }
    }

    fn updates_drop(id: u64) -> Self {
        let (done, _) = watch::channel(true);
        Self {
            id,
            drop_block: true,
            invalidated: AtomicBool::new(false),
            updates: Vec::new(),
            decided: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            done,
        }
    }

    /// Id of the first record in the block.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the last record in the block.
    pub fn last_id(&self) -> u64 {
        (self.id + self.updates.len() as u64).saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Synthetic marker returned to readers positioned before dropped records.
    pub fn is_drop_block(&self) -> bool {
        self.drop_block
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn get(&self, offset: usize) -> Option<&QueuedUpdate> {
        self.updates.get(offset)
    }

    /// Account one node's outcome for the record at `offset`.
    ///
    /// `required` is the number of nodes acknowledging the record. The
    /// emitting node always counts as an approval. A record succeeds once
    /// `consensus` approvals are collected and fails once more than
    /// `required - consensus` errors make the consensus unreachable. Each
    /// node is counted once, so the outcome does not depend on the order
    /// acknowledgments arrive in. `Success` and `Error` are reported
    /// exactly once, by the call that decided the record; every other call
    /// reports `Pending`.
    pub fn on_update_replicated(
        &self,
        node: NodeUid,
        consensus: usize,
        required: usize,
        offset: usize,
        is_emitter: bool,
        err: Option<&ReplError>,
    ) -> ReplicationResult {
        let Some(upd) = self.updates.get(offset) else {
            return ReplicationResult::Pending;
        };
        let (approvals, errors) = {
            let mut acks = upd.acks.lock();
            acks.add(node, is_emitter || err.is_none());
            (acks.approvals, acks.errors)
        };

        let verdict = if approvals >= consensus {
            STATUS_SUCCESS
        } else if errors > required.saturating_sub(consensus) {
            STATUS_ERROR
        } else {
            return ReplicationResult::Pending;
        };

        if !upd.decide(verdict) {
            return ReplicationResult::Pending;
        }
        tracing::trace!(
            "update {} decided by node {}: approvals={} errors={} consensus={}",
            self.id + offset as u64,
            node,
            approvals,
            errors,
            consensus
        );
        self.record_decision(verdict == STATUS_ERROR);
        if verdict == STATUS_SUCCESS {
            ReplicationResult::Success
        } else {
            ReplicationResult::Error
        }
    }

    fn record_decision(&self, failed: bool) {
        if failed {
            self.failed.store(true, Ordering::SeqCst);
        }
        let decided = self.decided.fetch_add(1, Ordering::SeqCst) + 1;
        if decided == self.updates.len() {
            self.done.send_replace(true);
        }
    }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        for upd in &self.updates {
            if upd.decide(STATUS_ERROR) {
                self.record_decision(true);
            }
        }
    }

    fn is_decided(&self) -> bool {
        self.updates.iter().all(QueuedUpdate::is_decided)
    }
}

/// Handle returned to the emitter of a block.
pub struct PushHandle {
    block: Arc<UpdateBlock>,
}

impl PushHandle {
    pub fn first_id(&self) -> u64 {
        self.block.id()
    }

    pub fn last_id(&self) -> u64 {
        self.block.last_id()
    }

    /// Wait until every record of the block is decided.
    ///
    /// Fails if any record could not reach consensus or was dropped from
    /// the queue before being decided.
    pub async fn wait(self) -> Result<()> {
        let mut rx = self.block.done.subscribe();
        loop {
            if *rx.borrow_and_update() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        if self.block.is_invalidated() {
            return Err(ReplError::UpdatesLost(format!(
                "updates {}..={} were dropped from the queue",
                self.block.id(),
                self.block.last_id()
            )));
        }
        if self.block.failed.load(Ordering::SeqCst) {
            return Err(ReplError::ReplicationQuorum(format!(
                "updates {}..={} did not reach consensus",
                self.block.id(),
                self.block.last_id()
            )));
        }
        Ok(())
    }
}

struct QueueInner {
    blocks: VecDeque<Arc<UpdateBlock>>,
    next_id: u64,
    retained: usize,
    /// Highest id erased from the head, by trimming or on overflow.
    erased_through: Option<u64>,
}

impl QueueInner {
    /// Lowest id still readable.
    fn first_id(&self) -> u64 {
        self.blocks.front().map_or(self.next_id, |b| b.id())
    }
}

/// The shared updates log.
pub struct UpdatesQueue {
    max_records: usize,
    inner: RwLock<QueueInner>,
    notifiers: Mutex<HashMap<ReaderKey, Arc<Notify>>>,
    positions: DashMap<ReaderKey, u64>,
}

impl UpdatesQueue {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            inner: RwLock::new(QueueInner {
                blocks: VecDeque::new(),
                next_id: 0,
                retained: 0,
                erased_through: None,
            }),
            notifiers: Mutex::new(HashMap::new()),
            positions: DashMap::new(),
        }
    }

    /// Append records atomically and wake all readers.
    pub fn push(&self, records: Vec<UpdateRecord>) -> PushHandle {
        let block = {
            let mut inner = self.inner.write();
            let block = Arc::new(UpdateBlock::new(inner.next_id, records));
            if !block.is_empty() {
                inner.next_id += block.len() as u64;
                inner.retained += block.len();
                inner.blocks.push_back(block.clone());
                self.trim_locked(&mut inner);
            }
            block
        };
        self.notify_readers();
        PushHandle { block }
    }

    /// Append records without keeping a handle; returns the first id.
    pub fn push_async(&self, records: Vec<UpdateRecord>) -> u64 {
        self.push(records).first_id()
    }

    /// Start tracking a reader; returns the id it should read from.
    ///
    /// Records are only trimmed once every registered reader has read past
    /// them.
    pub fn register_reader(&self, reader: ReaderKey) -> u64 {
        let inner = self.inner.read();
        let first = inner.first_id();
        self.positions.insert(reader, first);
        first
    }

    pub fn unregister_reader(&self, reader: ReaderKey) {
        self.positions.remove(&reader);
        self.trim();
    }

    /// Block holding `from`, or a drop block when records at `from` were
    /// already erased and the reader must resync.
    pub fn read(&self, from: u64, reader: ReaderKey) -> Option<Arc<UpdateBlock>> {
        let inner = self.inner.read();
        if let Some(mut position) = self.positions.get_mut(&reader) {
            *position = from;
        }
        if from >= inner.next_id {
            return None;
        }
        if let Some(erased) = inner.erased_through {
            if from <= erased {
                return Some(Arc::new(UpdateBlock::updates_drop(erased)));
            }
        }
        let idx = inner.blocks.partition_point(|b| b.last_id() < from);
        inner.blocks.get(idx).cloned()
    }

    /// Erase decided blocks every reader is done with from the head of the
    /// queue.
    pub fn trim(&self) {
        let mut inner = self.inner.write();
        self.trim_locked(&mut inner);
    }

    fn trim_locked(&self, inner: &mut QueueInner) {
        let lowest = self.positions.iter().map(|p| *p.value()).min();
        while let Some(front) = inner.blocks.front() {
            let passed = lowest.map_or(true, |pos| pos > front.last_id());
            if !passed || !front.is_decided() {
                break;
            }
            inner.retained -= front.len();
            inner.erased_through = Some(front.last_id());
            inner.blocks.pop_front();
        }

        while inner.retained > self.max_records && inner.blocks.len() > 1 {
            let Some(front) = inner.blocks.pop_front() else {
                break;
            };
            inner.retained -= front.len();
            front.invalidate();
            inner.erased_through = Some(front.last_id());
            tracing::warn!(
                "updates queue overflow: dropped updates {}..={}",
                front.id(),
                front.last_id()
            );
        }
    }

    pub fn add_data_notifier(&self, reader: ReaderKey, notifier: Arc<Notify>) {
        self.notifiers.lock().insert(reader, notifier);
    }

    pub fn remove_data_notifier(&self, reader: ReaderKey) {
        self.notifiers.lock().remove(&reader);
    }

    fn notify_readers(&self) {
        for notifier in self.notifiers.lock().values() {
            notifier.notify_one();
        }
    }

    /// Id the next pushed record will get.
    pub fn next_id(&self) -> u64 {
        self.inner.read().next_id
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        self.inner.read().retained
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{ExtendedLsn, Lsn, ServerId};
    use crate::replication::types::RecordKind;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn record(counter: i64) -> UpdateRecord {
        UpdateRecord::new(
            "items",
            ExtendedLsn::new(Lsn::new(ServerId(1), 1), Lsn::new(ServerId(1), counter)),
            ServerId(1),
            RecordKind::Truncate,
        )
    }

    fn failure() -> ReplError {
        ReplError::Network("refused".into())
    }

    #[test]
    fn test_push_assigns_sequential_ids() {
        let queue = UpdatesQueue::new(100);
        let first = queue.push(vec![record(1), record(2)]);
        let second = queue.push(vec![record(3)]);
        assert_eq!(first.first_id(), 0);
        assert_eq!(first.last_id(), 1);
        assert_eq!(second.first_id(), 2);
        assert_eq!(queue.next_id(), 3);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_read_by_id() {
        let queue = UpdatesQueue::new(100);
        queue.push(vec![record(1), record(2)]);
        queue.push(vec![record(3)]);
        let reader = ReaderKey::next();

        let block = queue.read(1, reader).unwrap();
        assert_eq!(block.id(), 0);
        assert_eq!(block.len(), 2);
        assert_eq!(queue.read(2, reader).unwrap().id(), 2);
        assert!(queue.read(3, reader).is_none());
    }

    // Three followers with a consensus of two, as a four node cluster runs
    #[test]
    fn test_quorum_success_then_failure() {
        let queue = UpdatesQueue::new(100);
        queue.push(vec![record(1)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        let err = failure();

        assert_eq!(
            block.on_update_replicated(1, 2, 3, 0, false, None),
            ReplicationResult::Pending
        );
        assert_eq!(
            block.on_update_replicated(2, 2, 3, 0, false, None),
            ReplicationResult::Success
        );
        assert_eq!(
            block.on_update_replicated(3, 2, 3, 0, false, Some(&err)),
            ReplicationResult::Pending
        );
        assert_eq!(block.get(0).unwrap().status(), ReplicationResult::Success);
    }

    #[test]
    fn test_quorum_failure_first_still_succeeds() {
        let queue = UpdatesQueue::new(100);
        queue.push(vec![record(1)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        let err = failure();

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
    }

    #[test]
    fn test_quorum_failures_make_consensus_unreachable() {
        let queue = UpdatesQueue::new(100);
        queue.push(vec![record(1)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        let err = failure();

        assert_eq!(
            block.on_update_replicated(1, 2, 3, 0, false, Some(&err)),
            ReplicationResult::Pending
        );
        assert_eq!(
            block.on_update_replicated(2, 2, 3, 0, false, Some(&err)),
            ReplicationResult::Error
        );
        assert_eq!(
            block.on_update_replicated(3, 2, 3, 0, false, None),
            ReplicationResult::Pending
        );
        assert_eq!(block.get(0).unwrap().status(), ReplicationResult::Error);
        let counters = block.get(0).unwrap().counters();
        assert_eq!(counters.approvals, 1);
        assert_eq!(counters.errors, 2);
        assert_eq!(counters.replicas, 3);
    }

    #[test]
    fn test_repeated_acks_count_once() {
        let queue = UpdatesQueue::new(100);
        queue.push(vec![record(1)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        let err = failure();

        assert_eq!(
            block.on_update_replicated(1, 2, 3, 0, false, Some(&err)),
            ReplicationResult::Pending
        );
        // The node applied the record on retry
        assert_eq!(
            block.on_update_replicated(1, 2, 3, 0, false, None),
            ReplicationResult::Pending
        );
        assert_eq!(
            block.on_update_replicated(1, 2, 3, 0, false, None),
            ReplicationResult::Pending
        );
        let counters = block.get(0).unwrap().counters();
        assert_eq!((counters.approvals, counters.errors, counters.replicas), (1, 0, 1));
        assert_eq!(
            block.on_update_replicated(2, 2, 3, 0, false, None),
            ReplicationResult::Success
        );
    }

    #[test]
    fn test_emitter_counts_as_approval() {
        let queue = UpdatesQueue::new(100);
        queue.push(vec![record(1)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        let err = failure();

        assert_eq!(
            block.on_update_replicated(1, 1, 2, 0, true, Some(&err)),
            ReplicationResult::Success
        );
    }

    #[test]
    fn test_zero_consensus_succeeds_on_first_ack() {
        let queue = UpdatesQueue::new(100);
        queue.push(vec![record(1)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        let err = failure();

        assert_eq!(
            block.on_update_replicated(1, 0, 3, 0, false, Some(&err)),
            ReplicationResult::Success
        );
    }

    #[tokio::test]
    async fn test_push_handle_resolves_on_success() {
        let queue = UpdatesQueue::new(100);
        let handle = queue.push(vec![record(1), record(2)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        block.on_update_replicated(1, 1, 1, 0, false, None);
        block.on_update_replicated(1, 1, 1, 1, false, None);

        tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_handle_reports_quorum_error() {
        let queue = UpdatesQueue::new(100);
        let handle = queue.push(vec![record(1)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        let err = failure();
        block.on_update_replicated(1, 1, 1, 0, false, Some(&err));

        let res = handle.wait().await;
        assert!(matches!(res, Err(ReplError::ReplicationQuorum(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_overflow_produces_drop_block() {
        let queue = UpdatesQueue::new(2);
        let dropped = queue.push(vec![record(1), record(2)]);
        queue.push(vec![record(3)]);
        let reader = ReaderKey::next();

        let block = queue.read(0, reader).unwrap();
        assert!(block.is_drop_block());
        assert_eq!(block.id(), 1);
        assert_eq!(queue.read(2, reader).unwrap().id(), 2);
        assert_eq!(queue.len(), 1);

        let res = dropped.wait().await;
        assert!(matches!(res, Err(ReplError::UpdatesLost(_))));
        assert!(logs_contain("updates queue overflow: dropped updates 0..=1"));
    }

    #[test]
    fn test_decided_prefix_is_trimmed() {
        let queue = UpdatesQueue::new(100);
        let reader = ReaderKey::next();
        assert_eq!(queue.register_reader(reader), 0);
        queue.push(vec![record(1)]);
        queue.push(vec![record(2)]);
        let block = queue.read(0, reader).unwrap();
        block.on_update_replicated(1, 1, 1, 0, false, None);

        assert_eq!(queue.read(1, reader).unwrap().id(), 1);
        queue.trim();
        assert_eq!(queue.len(), 1);
        // The reader already moved past the erased block
        let next = queue.read(1, reader).unwrap();
        assert!(!next.is_drop_block());
        assert_eq!(next.id(), 1);
    }

    #[test]
    fn test_trim_waits_for_lagging_reader() {
        let queue = UpdatesQueue::new(100);
        let fast = ReaderKey::next();
        let slow = ReaderKey::next();
        queue.register_reader(fast);
        queue.register_reader(slow);
        for counter in 1..=3 {
            queue.push(vec![record(counter)]);
        }
        for id in 0..3 {
            let block = queue.read(id, fast).unwrap();
            block.on_update_replicated(1, 0, 2, 0, false, None);
        }
        assert!(queue.read(3, fast).is_none());

        queue.trim();
        assert_eq!(queue.len(), 3);
        let block = queue.read(0, slow).unwrap();
        assert!(!block.is_drop_block());
        assert_eq!(block.id(), 0);

        assert_eq!(queue.read(2, slow).unwrap().id(), 2);
        queue.trim();
        assert_eq!(queue.len(), 1);

        queue.unregister_reader(slow);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_new_reader_starts_after_erased_records() {
        let queue = UpdatesQueue::new(100);
        let handle = queue.push(vec![record(1), record(2)]);
        let block = queue.read(0, ReaderKey::next()).unwrap();
        block.on_update_replicated(1, 0, 1, 0, false, None);
        block.on_update_replicated(1, 0, 1, 1, false, None);
        queue.push(vec![record(3)]);
        assert_eq!(queue.len(), 1);

        // Untracked readers behind the head have to resync
        let stale = queue.read(0, ReaderKey::next()).unwrap();
        assert!(stale.is_drop_block());
        assert_eq!(stale.id(), handle.last_id());

        let reader = ReaderKey::next();
        assert_eq!(queue.register_reader(reader), 2);
        assert_eq!(queue.read(2, reader).unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_notifications_are_coalesced() {
        let queue = UpdatesQueue::new(100);
        let reader = ReaderKey::next();
        let notify = Arc::new(Notify::new());
        queue.add_data_notifier(reader, notify.clone());

        queue.push(vec![record(1)]);
        queue.push(vec![record(2)]);

        tokio::time::timeout(Duration::from_millis(100), notify.notified())
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), notify.notified())
            .await
            .is_err());

        queue.remove_data_notifier(reader);
        queue.push(vec![record(3)]);
        assert!(tokio::time::timeout(Duration::from_millis(50), notify.notified())
            .await
            .is_err());
    }
}
