//! Work queue between the producers (collector, logger) and the writer.
//!
//! Items are tagged variants; the writer dispatches on the tag and each
//! variant's payload carries everything its repository statement needs.
//! Payload resources are released by ownership when the item is dropped.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use tokio_postgres::Client;

use crate::collector::hardware::HardwareInfo;
use crate::collector::snapshot::SnapshotData;
use crate::logger::autovacuum::AutovacuumLog;
use crate::logger::checkpoint::CheckpointLog;
use crate::logger::repolog::LogBatch;
use crate::maintenance::MaintenanceItem;
use crate::state::Shared;

/// Bound on repository attempts for a single item (and for reconnects).
pub const DB_MAX_RETRY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Snapshot,
    Checkpoint,
    Autovacuum,
    Autoanalyze,
    HardwareInfo,
    Maintenance,
    LogBatch,
}

pub enum QueueItem {
    Snapshot(SnapshotData),
    Checkpoint(CheckpointLog),
    Autovacuum(AutovacuumLog),
    Autoanalyze(AutovacuumLog),
    HardwareInfo(HardwareInfo),
    Maintenance(MaintenanceItem),
    LogBatch(LogBatch),
}

impl QueueItem {
    pub fn kind(&self) -> QueueKind {
        match self {
            QueueItem::Snapshot(_) => QueueKind::Snapshot,
            QueueItem::Checkpoint(_) => QueueKind::Checkpoint,
            QueueItem::Autovacuum(_) => QueueKind::Autovacuum,
            QueueItem::Autoanalyze(_) => QueueKind::Autoanalyze,
            QueueItem::HardwareInfo(_) => QueueKind::HardwareInfo,
            QueueItem::Maintenance(_) => QueueKind::Maintenance,
            QueueItem::LogBatch(_) => QueueKind::LogBatch,
        }
    }

    /// Run this item's repository statements. An error means the item may
    /// be retried by the writer.
    pub async fn execute(&self, client: &Client, instid: i64, shared: &Shared) -> Result<()> {
        match self {
            QueueItem::Snapshot(snap) => snap.execute(client, instid, shared).await,
            QueueItem::Checkpoint(ckpt) => ckpt.execute(client, instid).await,
            QueueItem::Autovacuum(av) => av.execute_vacuum(client, instid).await,
            QueueItem::Autoanalyze(av) => av.execute_analyze(client, instid).await,
            QueueItem::HardwareInfo(hw) => hw.execute(client, instid).await,
            QueueItem::Maintenance(m) => m.execute(client, shared).await,
            QueueItem::LogBatch(batch) => batch.execute(client, instid).await,
        }
    }
}

/// A queue entry with its retry count.
pub struct Queued {
    pub item: QueueItem,
    pub retry: u32,
}

/// What the writer should do with an entry after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Attempt succeeded; drop the item and continue.
    Done,
    /// Attempt failed; keep the item at the head and stop this cycle.
    Retry,
    /// Retry bound reached; drop the item and continue.
    Discard,
}

/// Apply the bounded-retry policy to one attempt's outcome.
pub fn disposition(succeeded: bool, retry: &mut u32) -> Disposition {
    if succeeded {
        return Disposition::Done;
    }
    *retry += 1;
    if *retry >= DB_MAX_RETRY {
        Disposition::Discard
    } else {
        Disposition::Retry
    }
}

/// FIFO of work destined for the repository. Any task may send; only the
/// writer drains.
pub struct WriterQueue {
    inner: Mutex<VecDeque<Queued>>,
}

impl WriterQueue {
    pub fn new() -> WriterQueue {
        WriterQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an item; the retry count starts at zero.
    pub fn send(&self, item: QueueItem) {
        let mut queue = self.inner.lock().expect("writer queue poisoned");
        queue.push_back(Queued { item, retry: 0 });
    }

    /// Is an item of `kind` already waiting? Used to suppress a snapshot
    /// while the previous one has not been written yet.
    pub fn has_kind(&self, kind: QueueKind) -> bool {
        let queue = self.inner.lock().expect("writer queue poisoned");
        queue.iter().any(|q| q.item.kind() == kind)
    }

    /// Atomically detach the current backlog; items sent while the writer
    /// is processing land in a fresh list.
    pub fn drain_for_processing(&self) -> Vec<Queued> {
        let mut queue = self.inner.lock().expect("writer queue poisoned");
        queue.drain(..).collect()
    }

    /// Put failed-but-retryable items back, in order, ahead of anything
    /// that arrived in the meantime.
    pub fn requeue_head(&self, items: Vec<Queued>) {
        let mut queue = self.inner.lock().expect("writer queue poisoned");
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("writer queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WriterQueue {
    fn default() -> Self {
        WriterQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::MaintenanceItem;

    fn maintenance_item(period: i64) -> QueueItem {
        QueueItem::Maintenance(MaintenanceItem::snapshot_retention(period))
    }

    #[test]
    fn send_preserves_submission_order() {
        let queue = WriterQueue::new();
        queue.send(maintenance_item(1));
        queue.send(maintenance_item(2));
        queue.send(maintenance_item(3));

        let drained = queue.drain_for_processing();
        let periods: Vec<i64> = drained
            .iter()
            .map(|q| match &q.item {
                QueueItem::Maintenance(m) => m.period_epoch(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(periods, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_head_goes_before_new_arrivals() {
        let queue = WriterQueue::new();
        queue.send(maintenance_item(1));
        queue.send(maintenance_item(2));

        let failed = queue.drain_for_processing();
        queue.send(maintenance_item(3));
        queue.requeue_head(failed);

        let order: Vec<i64> = queue
            .drain_for_processing()
            .iter()
            .map(|q| match &q.item {
                QueueItem::Maintenance(m) => m.period_epoch(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn has_kind_spots_queued_items() {
        let queue = WriterQueue::new();
        assert!(!queue.has_kind(QueueKind::Maintenance));
        queue.send(maintenance_item(1));
        assert!(queue.has_kind(QueueKind::Maintenance));
        assert!(!queue.has_kind(QueueKind::Snapshot));
    }

    #[test]
    fn retry_policy_discards_at_the_bound() {
        let mut retry = 0;
        for attempt in 1..DB_MAX_RETRY {
            assert_eq!(disposition(false, &mut retry), Disposition::Retry);
            assert_eq!(retry, attempt);
        }
        assert_eq!(disposition(false, &mut retry), Disposition::Discard);
        assert_eq!(retry, DB_MAX_RETRY);

        let mut fresh = 0;
        assert_eq!(disposition(true, &mut fresh), Disposition::Done);
        assert_eq!(fresh, 0);
    }
}
