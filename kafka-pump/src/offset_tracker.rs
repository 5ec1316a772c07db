//! Offset Tracker - per-partition ledger of received but uncommitted offsets
//!
//! Records are registered in arrival order with `received` and acknowledged in any
//! order with `mark_as_processed`. The ledger only ever gives up a contiguous prefix
//! of processed offsets, so the offset handed to the broker never skips a record
//! that is still in flight.
//!
//! The tracker never touches the consumer. Each advance is sent as a commit intent
//! over a channel drained by the pump task, which owns the consumer handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TrackerError;
use crate::metrics_consts::{
    OFFSET_TRACKER_OUT_OF_ORDER_COMPLETIONS, OFFSET_TRACKER_PENDING_OFFSETS,
    OFFSET_TRACKER_STALE_COMPLETIONS, OFFSET_TRACKER_UNKNOWN_OFFSET,
};
use crate::types::{ConsumedRecord, PartitionOffset, TopicPartition};

pub type CommitSender = mpsc::UnboundedSender<PartitionOffset>;
pub type CommitReceiver = mpsc::UnboundedReceiver<PartitionOffset>;

pub fn commit_channel() -> (CommitSender, CommitReceiver) {
    mpsc::unbounded_channel()
}

/// Identifies one ownership period of a partition. A ledger cleared on revocation
/// and rebuilt on reassignment gets a new epoch, so completions of records received
/// before the revocation cannot advance the new ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEpoch(pub(crate) u64);

struct PartitionLedger {
    topic_partition: TopicPartition,
    epoch: LedgerEpoch,
    /// offset -> processed
    pending: BTreeMap<i64, bool>,
    last_received: Option<i64>,
    last_committed: Option<i64>,
}

impl PartitionLedger {
    fn new(topic_partition: TopicPartition, epoch: LedgerEpoch) -> Self {
        Self {
            topic_partition,
            epoch,
            pending: BTreeMap::new(),
            last_received: None,
            last_committed: None,
        }
    }

    fn check_partition(&self, record: &ConsumedRecord) -> Result<(), TrackerError> {
        if record.topic_partition() != &self.topic_partition {
            return Err(TrackerError::PartitionMismatch {
                expected: self.topic_partition.clone(),
                actual: record.topic_partition().clone(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, record: &ConsumedRecord) -> Result<(), TrackerError> {
        self.check_partition(record)?;

        let offset = record.offset();
        if let Some(last_received) = self.last_received {
            if offset <= last_received {
                return Err(TrackerError::OutOfOrderOffset {
                    partition: self.topic_partition.clone(),
                    offset,
                    last_received,
                });
            }
        }

        self.pending.insert(offset, false);
        self.last_received = Some(offset);
        Ok(())
    }

    /// Returns the highest offset of the processed prefix removed by this call, if any.
    fn mark_and_compact(&mut self, record: &ConsumedRecord) -> Result<Option<i64>, TrackerError> {
        self.check_partition(record)?;

        let offset = record.offset();
        match self.pending.get_mut(&offset) {
            Some(processed) => {
                if *processed {
                    debug!(
                        topic = self.topic_partition.topic(),
                        partition = self.topic_partition.partition(),
                        offset,
                        "Offset already marked as processed"
                    );
                }
                *processed = true;
            }
            None => {
                warn!(
                    topic = self.topic_partition.topic(),
                    partition = self.topic_partition.partition(),
                    offset,
                    last_committed = ?self.last_committed,
                    "Marking an offset that is not tracked, ignoring"
                );
                metrics::counter!(OFFSET_TRACKER_UNKNOWN_OFFSET).increment(1);
                return Ok(None);
            }
        }

        let mut last_removed = None;
        while let Some((&lowest, &processed)) = self.pending.first_key_value() {
            if !processed {
                break;
            }
            self.pending.remove(&lowest);
            last_removed = Some(lowest);
        }

        if let Some(advanced_to) = last_removed {
            self.last_committed = Some(advanced_to);
        }
        Ok(last_removed)
    }
}

pub struct OffsetTracker {
    ledgers: DashMap<TopicPartition, Arc<Mutex<PartitionLedger>>>,
    next_epoch: AtomicU64,
    commits: CommitSender,
}

impl OffsetTracker {
    pub fn new(commits: CommitSender) -> Self {
        Self {
            ledgers: DashMap::new(),
            next_epoch: AtomicU64::new(0),
            commits,
        }
    }

    fn ledger(&self, topic_partition: &TopicPartition) -> Option<Arc<Mutex<PartitionLedger>>> {
        self.ledgers
            .get(topic_partition)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn lock(ledger: &Mutex<PartitionLedger>) -> MutexGuard<'_, PartitionLedger> {
        // Every ledger mutation keeps the map consistent before it can panic.
        ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a record before it is dispatched. Offsets must arrive in
    /// increasing order per partition. The returned epoch is handed back to
    /// `mark_as_processed`.
    pub fn received(&self, record: &ConsumedRecord) -> Result<LedgerEpoch, TrackerError> {
        let ledger = Arc::clone(
            &self
                .ledgers
                .entry(record.topic_partition().clone())
                .or_insert_with(|| {
                    let epoch = LedgerEpoch(self.next_epoch.fetch_add(1, Ordering::SeqCst));
                    Arc::new(Mutex::new(PartitionLedger::new(
                        record.topic_partition().clone(),
                        epoch,
                    )))
                }),
        );

        let mut ledger = Self::lock(&ledger);
        ledger.insert(record)?;

        metrics::gauge!(
            OFFSET_TRACKER_PENDING_OFFSETS,
            "topic" => record.topic().to_string(),
            "partition" => record.partition().to_string()
        )
        .set(ledger.pending.len() as f64);
        Ok(ledger.epoch)
    }

    /// Mark a record processed and advance the partition past the contiguous
    /// processed prefix. When the prefix moved, exactly one commit intent is sent
    /// for the highest offset removed and that offset is returned. Records received
    /// under an older epoch of the partition are ignored.
    pub fn mark_as_processed(
        &self,
        record: &ConsumedRecord,
        epoch: LedgerEpoch,
    ) -> Result<Option<i64>, TrackerError> {
        let Some(ledger) = self.ledger(record.topic_partition()) else {
            warn!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                "Marking an offset for a partition that was never received, ignoring"
            );
            metrics::counter!(OFFSET_TRACKER_UNKNOWN_OFFSET).increment(1);
            return Ok(None);
        };

        let mut ledger = Self::lock(&ledger);
        if ledger.epoch != epoch {
            debug!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                "Completion for a record received before the partition was revoked, ignoring"
            );
            metrics::counter!(OFFSET_TRACKER_STALE_COMPLETIONS).increment(1);
            return Ok(None);
        }
        let advanced_to = ledger.mark_and_compact(record)?;

        let Some(offset) = advanced_to else {
            if !ledger.pending.is_empty() {
                metrics::counter!(OFFSET_TRACKER_OUT_OF_ORDER_COMPLETIONS).increment(1);
            }
            return Ok(None);
        };

        metrics::gauge!(
            OFFSET_TRACKER_PENDING_OFFSETS,
            "topic" => record.topic().to_string(),
            "partition" => record.partition().to_string()
        )
        .set(ledger.pending.len() as f64);

        debug!(
            topic = record.topic(),
            partition = record.partition(),
            offset,
            pending = ledger.pending.len(),
            "Advancing partition to processed prefix"
        );

        // Sent while holding the ledger lock so intents for one partition are queued
        // in increasing offset order.
        let intent = PartitionOffset::new(record.topic_partition().clone(), offset);
        if self.commits.send(intent).is_err() {
            warn!(
                topic = record.topic(),
                partition = record.partition(),
                offset,
                "Commit queue closed, offset will not be committed"
            );
        }

        Ok(Some(offset))
    }

    /// Forget a revoked partition. Records still in flight for it finish without
    /// advancing anything, and a later reassignment starts a fresh ledger.
    pub fn clear_partition(&self, topic_partition: &TopicPartition) {
        if let Some((_, ledger)) = self.ledgers.remove(topic_partition) {
            let pending = Self::lock(&ledger).pending.len();
            debug!(
                topic = topic_partition.topic(),
                partition = topic_partition.partition(),
                pending,
                "Cleared offset ledger for revoked partition"
            );
            metrics::gauge!(
                OFFSET_TRACKER_PENDING_OFFSETS,
                "topic" => topic_partition.topic().to_string(),
                "partition" => topic_partition.partition().to_string()
            )
            .set(0.0);
        }
    }

    /// Number of offsets still waiting on a processed prefix for a partition.
    pub fn pending_count(&self, topic_partition: &TopicPartition) -> usize {
        match self.ledger(topic_partition) {
            Some(ledger) => {
                let count = Self::lock(&ledger).pending.len();
                count
            }
            None => 0,
        }
    }

    pub fn last_committed(&self, topic_partition: &TopicPartition) -> Option<i64> {
        let ledger = self.ledger(topic_partition)?;
        let last_committed = Self::lock(&ledger).last_committed;
        last_committed
    }

    pub fn partition_count(&self) -> usize {
        self.ledgers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn record(partition: i32, offset: i64) -> ConsumedRecord {
        ConsumedRecord::new(TopicPartition::new("test-topic", partition), offset)
    }

    /// Receive every offset on one partition, returning the ledger epoch.
    fn receive_all(tracker: &OffsetTracker, partition: i32, offsets: &[i64]) -> LedgerEpoch {
        let mut epoch = None;
        for offset in offsets {
            epoch = Some(tracker.received(&record(partition, *offset)).unwrap());
        }
        epoch.unwrap()
    }

    fn drain_commits(rx: &mut CommitReceiver) -> Vec<i64> {
        let mut offsets = Vec::new();
        while let Ok(intent) = rx.try_recv() {
            offsets.push(intent.offset());
        }
        offsets
    }

    #[test]
    fn commits_contiguous_prefix_only() {
        let (tx, mut rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);
        let epoch = receive_all(&tracker, 0, &[1, 2, 3]);

        assert_eq!(tracker.mark_as_processed(&record(0, 2), epoch).unwrap(), None);
        assert!(drain_commits(&mut rx).is_empty());

        assert_eq!(tracker.mark_as_processed(&record(0, 1), epoch).unwrap(), Some(2));
        assert_eq!(tracker.mark_as_processed(&record(0, 3), epoch).unwrap(), Some(3));

        assert_eq!(drain_commits(&mut rx), vec![2, 3]);
        assert_eq!(tracker.pending_count(&TopicPartition::new("test-topic", 0)), 0);
    }

    #[test]
    fn gap_blocks_commit_until_filled() {
        let (tx, mut rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);
        let epoch = receive_all(&tracker, 0, &[5, 6, 7]);

        // 5 alone is a prefix and advances, 7 waits behind 6
        assert_eq!(tracker.mark_as_processed(&record(0, 5), epoch).unwrap(), Some(5));
        assert_eq!(tracker.mark_as_processed(&record(0, 7), epoch).unwrap(), None);
        assert_eq!(drain_commits(&mut rx), vec![5]);

        assert_eq!(tracker.mark_as_processed(&record(0, 6), epoch).unwrap(), Some(7));
        assert_eq!(drain_commits(&mut rx), vec![7]);
    }

    #[test]
    fn no_commit_while_first_offset_outstanding() {
        let (tx, mut rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);
        let epoch = receive_all(&tracker, 0, &[5, 6, 7]);

        tracker.mark_as_processed(&record(0, 7), epoch).unwrap();
        tracker.mark_as_processed(&record(0, 6), epoch).unwrap();
        assert!(drain_commits(&mut rx).is_empty());

        tracker.mark_as_processed(&record(0, 5), epoch).unwrap();
        assert_eq!(drain_commits(&mut rx), vec![7]);
    }

    #[test]
    fn any_completion_order_commits_gap_free_non_decreasing_offsets() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let (tx, mut rx) = commit_channel();
            let tracker = OffsetTracker::new(tx);

            // Sparse offsets, as compaction and transactions leave gaps in real partitions
            let offsets: Vec<i64> = (0..12).map(|i| 100 + i * 3).collect();
            let epoch = receive_all(&tracker, 0, &offsets);

            let mut order = offsets.clone();
            order.shuffle(&mut rng);

            let mut processed = Vec::new();
            for offset in order {
                processed.push(offset);
                if let Some(committed) = tracker.mark_as_processed(&record(0, offset), epoch).unwrap() {
                    // Every received offset up to the committed one must be processed
                    assert!(offsets
                        .iter()
                        .filter(|o| **o <= committed)
                        .all(|o| processed.contains(o)));
                }
            }

            let committed = drain_commits(&mut rx);
            assert!(!committed.is_empty());
            assert!(committed.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(committed.last(), offsets.last());
        }
    }

    #[test]
    fn unknown_offsets_are_ignored() {
        let (tx, mut rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);

        assert_eq!(tracker.mark_as_processed(&record(0, 1), LedgerEpoch(0)).unwrap(), None);

        let epoch = receive_all(&tracker, 0, &[1, 2]);
        assert_eq!(tracker.mark_as_processed(&record(0, 1), epoch).unwrap(), Some(1));

        // Already compacted away
        assert_eq!(tracker.mark_as_processed(&record(0, 1), epoch).unwrap(), None);
        assert_eq!(tracker.mark_as_processed(&record(0, 42), epoch).unwrap(), None);
        assert_eq!(tracker.pending_count(&TopicPartition::new("test-topic", 0)), 1);

        assert_eq!(tracker.mark_as_processed(&record(0, 2), epoch).unwrap(), Some(2));
        assert_eq!(drain_commits(&mut rx), vec![1, 2]);
    }

    #[test]
    fn duplicate_mark_does_not_commit_twice() {
        let (tx, mut rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);
        let epoch = receive_all(&tracker, 0, &[1, 2]);

        tracker.mark_as_processed(&record(0, 2), epoch).unwrap();
        tracker.mark_as_processed(&record(0, 2), epoch).unwrap();
        assert!(drain_commits(&mut rx).is_empty());

        tracker.mark_as_processed(&record(0, 1), epoch).unwrap();
        assert_eq!(drain_commits(&mut rx), vec![2]);
    }

    #[test]
    fn out_of_order_receive_is_rejected() {
        let (tx, _rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);

        tracker.received(&record(0, 10)).unwrap();
        let err = tracker.received(&record(0, 9)).unwrap_err();
        assert_eq!(
            err,
            TrackerError::OutOfOrderOffset {
                partition: TopicPartition::new("test-topic", 0),
                offset: 9,
                last_received: 10,
            }
        );
        assert!(tracker.received(&record(0, 10)).is_err());
        assert_eq!(tracker.pending_count(&TopicPartition::new("test-topic", 0)), 1);
    }

    #[test]
    fn ledger_rejects_foreign_partition() {
        let mut ledger =
            PartitionLedger::new(TopicPartition::new("test-topic", 0), LedgerEpoch(0));
        assert!(matches!(
            ledger.insert(&record(1, 0)),
            Err(TrackerError::PartitionMismatch { .. })
        ));
    }

    #[test]
    fn partitions_are_tracked_independently() {
        let (tx, mut rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);

        let first = receive_all(&tracker, 0, &[1]);
        let second = receive_all(&tracker, 1, &[1, 2]);

        tracker.mark_as_processed(&record(1, 2), second).unwrap();
        tracker.mark_as_processed(&record(0, 1), first).unwrap();

        let intents: Vec<PartitionOffset> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            intents,
            vec![PartitionOffset::new(TopicPartition::new("test-topic", 0), 1)]
        );
        assert_eq!(tracker.partition_count(), 2);
        assert_eq!(tracker.last_committed(&TopicPartition::new("test-topic", 1)), None);
    }

    #[test]
    fn revoked_partition_accepts_redelivery() {
        let (tx, mut rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);
        let partition = TopicPartition::new("test-topic", 0);

        let before = receive_all(&tracker, 0, &[1, 2]);
        tracker.clear_partition(&partition);
        assert_eq!(tracker.partition_count(), 0);

        // Reassigned: the broker resumes from the committed position
        let after = receive_all(&tracker, 0, &[1, 2]);
        assert_ne!(before, after);

        // Completions from before the revocation must not advance the new ledger
        assert_eq!(tracker.mark_as_processed(&record(0, 1), before).unwrap(), None);
        assert_eq!(tracker.mark_as_processed(&record(0, 2), before).unwrap(), None);
        assert!(drain_commits(&mut rx).is_empty());
        assert_eq!(tracker.pending_count(&partition), 2);

        tracker.mark_as_processed(&record(0, 2), after).unwrap();
        tracker.mark_as_processed(&record(0, 1), after).unwrap();
        assert_eq!(drain_commits(&mut rx), vec![2]);
    }

    #[test]
    fn completions_after_revocation_are_no_ops() {
        let (tx, mut rx) = commit_channel();
        let tracker = OffsetTracker::new(tx);

        let epoch = receive_all(&tracker, 0, &[7]);
        tracker.clear_partition(&TopicPartition::new("test-topic", 0));
        tracker.clear_partition(&TopicPartition::new("test-topic", 0));

        assert_eq!(tracker.mark_as_processed(&record(0, 7), epoch).unwrap(), None);
        assert!(drain_commits(&mut rx).is_empty());
    }

    #[test]
    fn concurrent_completions_same_partition() {
        use std::thread;

        let (tx, mut rx) = commit_channel();
        let tracker = Arc::new(OffsetTracker::new(tx));
        let offsets: Vec<i64> = (0..100).collect();
        let epoch = receive_all(&tracker, 0, &offsets);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for offset in (0..100).rev().filter(|o| o % 4 == worker) {
                        tracker.mark_as_processed(&record(0, offset), epoch).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let committed = drain_commits(&mut rx);
        assert!(committed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(committed.last(), Some(&99));
        assert_eq!(
            tracker.last_committed(&TopicPartition::new("test-topic", 0)),
            Some(99)
        );
    }
}
