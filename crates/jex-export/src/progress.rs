//! Export progress tracking
//!
//! Workers post consumer positions on an unbounded channel and never block on
//! it. A single aggregator task owns the channel's receiving end, sums the
//! progress of every partition against the offset ranges captured at start and
//! renders it, until every worker has reported its terminal `Done`.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use jex_common::{Offset, OffsetRanges, PartitionId, ProgressMessage};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Create a progress bar with custom message, hidden when `visible` is false
pub fn create_progress_bar(total: u64, message: &str, visible: bool) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if !visible {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Create the two ends of a progress channel
pub fn progress_channel() -> (ProgressSender, mpsc::UnboundedReceiver<ProgressMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, rx)
}

/// Producer end of the progress channel, cloned into every worker
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressMessage>,
}

impl ProgressSender {
    /// Report the current position of some partitions.
    ///
    /// A closed channel means the aggregator is gone; progress is then dropped.
    pub fn report(&self, positions: BTreeMap<PartitionId, Offset>) {
        if positions.is_empty() {
            return;
        }
        if self.tx.send(ProgressMessage::Offsets(positions)).is_err() {
            trace!("Progress receiver closed, dropping report");
        }
    }

    /// Guard posting the `Done` sentinel of `worker` when dropped
    pub fn done_guard(&self, worker: usize) -> DoneGuard {
        DoneGuard {
            tx: self.tx.clone(),
            worker,
        }
    }
}

/// Posts `Done { worker }` exactly once, on every exit path of the worker
#[derive(Debug)]
pub struct DoneGuard {
    tx: mpsc::UnboundedSender<ProgressMessage>,
    worker: usize,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(ProgressMessage::Done {
            worker: self.worker,
        });
    }
}

/// Final state of the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub progress: u64,
    pub finished_workers: usize,
    pub expected_workers: usize,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.finished_workers >= self.expected_workers
    }
}

/// Single consumer of the progress channel
#[derive(Debug)]
pub struct ProgressAggregator {
    ranges: Arc<OffsetRanges>,
    expected_workers: usize,
    positions: BTreeMap<PartitionId, Offset>,
    finished_workers: BTreeSet<usize>,
    label: String,
}

impl ProgressAggregator {
    pub fn new(ranges: Arc<OffsetRanges>, expected_workers: usize, object_type: &str) -> Self {
        Self {
            ranges,
            expected_workers,
            positions: BTreeMap::new(),
            finished_workers: BTreeSet::new(),
            label: format!("Journal export ({})", object_type),
        }
    }

    /// Total amount of work: the sum of every partition range length
    pub fn total(&self) -> u64 {
        self.ranges.total()
    }

    /// Work done so far over the partitions that reported at least once
    pub fn progress(&self) -> u64 {
        self.positions
            .iter()
            .filter_map(|(partition, &position)| {
                let range = self.ranges.get(*partition)?;
                Some((position.min(range.high) - range.low).max(0) as u64)
            })
            .sum()
    }

    pub fn finished_workers(&self) -> usize {
        self.finished_workers.len()
    }

    pub fn is_complete(&self) -> bool {
        self.finished_workers.len() >= self.expected_workers
    }

    /// Merge one message; returns true once every expected worker is done
    pub fn apply(&mut self, message: ProgressMessage) -> bool {
        match message {
            ProgressMessage::Offsets(offsets) => {
                for (partition, position) in offsets {
                    let entry = self.positions.entry(partition).or_insert(position);
                    *entry = (*entry).max(position);
                }
            },
            ProgressMessage::Done { worker } => {
                if !self.finished_workers.insert(worker) {
                    debug!(worker, "Ignoring duplicate done message");
                }
            },
        }
        self.is_complete()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total(),
            progress: self.progress(),
            finished_workers: self.finished_workers(),
            expected_workers: self.expected_workers,
        }
    }

    fn worker_status(&self) -> String {
        format!(
            "{} ({}/{} workers active)",
            self.label,
            self.expected_workers - self.finished_workers().min(self.expected_workers),
            self.expected_workers
        )
    }

    /// Drain the channel until all workers are done or every sender is gone
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ProgressMessage>,
        show_progress: bool,
    ) -> ProgressSnapshot {
        let pb = create_progress_bar(self.total(), &self.worker_status(), show_progress);

        if !self.is_complete() {
            while let Some(message) = rx.recv().await {
                let complete = self.apply(message);
                pb.set_position(self.progress());
                pb.set_message(self.worker_status());
                if complete {
                    break;
                }
            }
        }

        pb.finish_and_clear();
        let snapshot = self.snapshot();
        debug!(
            progress = snapshot.progress,
            total = snapshot.total,
            finished_workers = snapshot.finished_workers,
            "Progress aggregation finished"
        );
        snapshot
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jex_common::PartitionOffsetRange;

    fn scenario_ranges() -> Arc<OffsetRanges> {
        Arc::new(
            [
                PartitionOffsetRange::new(0, 0, 100).unwrap(),
                PartitionOffsetRange::new(1, 0, 0).unwrap(),
                PartitionOffsetRange::new(2, 50, 50).unwrap(),
                PartitionOffsetRange::new(3, 0, 10).unwrap(),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn test_create_progress_bar() {
        let pb = create_progress_bar(100, "Processing items", false);
        assert_eq!(pb.length(), Some(100));
    }

    #[test]
    fn test_progress_is_clamped_to_ranges() {
        let mut aggregator = ProgressAggregator::new(scenario_ranges(), 2, "revision");
        assert_eq!(aggregator.total(), 110);
        assert_eq!(aggregator.progress(), 0);

        aggregator.apply(ProgressMessage::position(0, 40));
        aggregator.apply(ProgressMessage::position(3, 10));
        assert_eq!(aggregator.progress(), 50);

        // Stale reports never move progress backwards
        aggregator.apply(ProgressMessage::position(0, 20));
        assert_eq!(aggregator.progress(), 50);

        aggregator.apply(ProgressMessage::position(0, 250));
        assert_eq!(aggregator.progress(), 110);
    }

    #[test]
    fn test_completes_after_every_worker_done_in_any_order() {
        let mut aggregator = ProgressAggregator::new(scenario_ranges(), 3, "origin");
        assert!(!aggregator.apply(ProgressMessage::Done { worker: 2 }));
        assert!(!aggregator.apply(ProgressMessage::Done { worker: 2 }));
        assert!(!aggregator.apply(ProgressMessage::Done { worker: 0 }));
        assert!(aggregator.apply(ProgressMessage::Done { worker: 1 }));
        assert_eq!(aggregator.finished_workers(), 3);
    }

    #[tokio::test]
    async fn test_run_returns_after_all_done() {
        let (tx, rx) = progress_channel();
        let aggregator = ProgressAggregator::new(scenario_ranges(), 2, "revision");

        let first = tx.done_guard(0);
        let second = tx.done_guard(1);
        tx.report(BTreeMap::from([(0, 100), (3, 10)]));
        drop(first);
        drop(second);

        let snapshot = aggregator.run(rx, false).await;
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.progress, 110);
        assert_eq!(snapshot.total, 110);
    }

    #[tokio::test]
    async fn test_run_stops_when_channel_closes() {
        let (tx, rx) = progress_channel();
        let aggregator = ProgressAggregator::new(scenario_ranges(), 2, "revision");
        tx.report(BTreeMap::from([(3, 5)]));
        drop(tx);

        let snapshot = aggregator.run(rx, false).await;
        assert!(!snapshot.is_complete());
        assert_eq!(snapshot.progress, 5);
    }

    #[tokio::test]
    async fn test_zero_workers_completes_immediately() {
        let (_tx, rx) = progress_channel();
        let aggregator = ProgressAggregator::new(Arc::new(OffsetRanges::new()), 0, "origin");
        let snapshot = aggregator.run(rx, false).await;
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.total, 0);
    }

    #[test]
    fn test_done_guard_sends_on_panic() {
        let (tx, mut rx) = progress_channel();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = tx.done_guard(7);
            panic!("worker exploded");
        }));
        assert!(result.is_err());
        assert_eq!(rx.try_recv().unwrap(), ProgressMessage::Done { worker: 7 });
    }
}
