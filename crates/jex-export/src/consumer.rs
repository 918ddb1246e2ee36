//! Bounded partition consumer
//!
//! Reads a fixed set of partitions up to the high watermarks captured at run
//! start. Each assigned partition moves from `Active` to `Exhausted` once the
//! consumer position reaches its ceiling; the journal subscription is always
//! the set of Active partitions, and the consumer is finished when none is
//! left.

use jex_common::{Offset, OffsetRanges, PartitionId, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::journal::{JournalClient, JournalMessage};
use crate::progress::ProgressSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Still has messages below its ceiling
    Active,
    /// Position reached the ceiling, or nothing to read at all
    Exhausted,
}

pub struct BoundedConsumer {
    client: Box<dyn JournalClient>,
    topic: String,
    ranges: Arc<OffsetRanges>,
    states: BTreeMap<PartitionId, PartitionState>,
    /// Next offset to read, per partition
    positions: BTreeMap<PartitionId, Offset>,
    /// Positions delivered since the last commit
    pending: BTreeMap<PartitionId, Offset>,
    progress: ProgressSender,
    progress_interval: u64,
    delivered: u64,
}

impl BoundedConsumer {
    /// Partitions assigned here but missing from `ranges` hold nothing to
    /// read and start out Exhausted.
    pub fn new(
        client: Box<dyn JournalClient>,
        topic: impl Into<String>,
        ranges: Arc<OffsetRanges>,
        assignment: &[PartitionId],
        progress: ProgressSender,
        progress_interval: u64,
    ) -> Self {
        let states = assignment
            .iter()
            .map(|&partition| {
                let state = match ranges.get(partition) {
                    Some(range) if !range.is_empty() => PartitionState::Active,
                    _ => PartitionState::Exhausted,
                };
                (partition, state)
            })
            .collect();

        Self {
            client,
            topic: topic.into(),
            ranges,
            states,
            positions: BTreeMap::new(),
            pending: BTreeMap::new(),
            progress,
            progress_interval: progress_interval.max(1),
            delivered: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self, partition: PartitionId) -> Option<PartitionState> {
        self.states.get(&partition).copied()
    }

    pub fn position(&self, partition: PartitionId) -> Option<Offset> {
        self.positions.get(&partition).copied()
    }

    /// Partitions currently subscribed to
    pub fn active_partitions(&self) -> Vec<PartitionId> {
        self.states
            .iter()
            .filter(|(_, state)| **state == PartitionState::Active)
            .map(|(&partition, _)| partition)
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        !self.states.values().any(|s| *s == PartitionState::Active)
    }

    /// Number of messages delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Seed positions from the group's committed offsets, then assign the
    /// partitions that are still Active.
    pub fn subscribe(&mut self) -> Result<()> {
        let assigned: Vec<PartitionId> = self.states.keys().copied().collect();
        if !assigned.is_empty() {
            let committed = self.client.committed(&self.topic, &assigned)?;
            let mut resumed = BTreeMap::new();
            for (partition, offset) in committed {
                if let Some(offset) = offset.filter(|o| *o >= 0) {
                    debug!(partition, committed = offset, "Resuming from committed offset");
                    self.advance(partition, offset);
                    resumed.insert(partition, offset);
                }
            }
            self.progress.report(resumed);
        }

        let active = self.active_partitions();
        info!(
            topic = %self.topic,
            assigned = assigned.len(),
            active = active.len(),
            "Subscribing to partitions"
        );
        self.client.assign(&self.topic, &active)
    }

    /// Record that `partition` will next be read at `position`.
    ///
    /// Returns true when this moved the partition to Exhausted.
    pub fn advance(&mut self, partition: PartitionId, position: Offset) -> bool {
        let entry = self.positions.entry(partition).or_insert(position);
        *entry = (*entry).max(position);
        let position = *entry;

        let Some(range) = self.ranges.get(partition) else {
            return false;
        };
        if self.states.get(&partition) != Some(&PartitionState::Active)
            || !range.is_exhausted_at(position)
        {
            return false;
        }

        self.states.insert(partition, PartitionState::Exhausted);
        self.progress.report(BTreeMap::from([(partition, position)]));
        info!(
            partition,
            position,
            remaining = self.active_partitions().len(),
            "Partition exhausted"
        );
        true
    }

    /// Next batch of messages within the ceilings.
    ///
    /// Messages of partitions no longer Active, or at or above the partition
    /// high watermark, are dropped and never returned. A partition reported
    /// at its end moves to the reported position, so offsets that are never
    /// delivered do not keep it Active.
    pub fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<Vec<JournalMessage>> {
        if self.is_finished() {
            return Ok(Vec::new());
        }

        let polled = self.client.poll(max_messages, timeout)?;
        let mut delivered = Vec::with_capacity(polled.messages.len());
        let mut exhausted = false;

        for message in polled.messages {
            let within = self.state(message.partition) == Some(PartitionState::Active)
                && self
                    .ranges
                    .get(message.partition)
                    .is_some_and(|r| message.offset < r.high);
            if !within {
                trace!(
                    partition = message.partition,
                    offset = message.offset,
                    "Dropping message beyond ceiling"
                );
                continue;
            }

            let position = message.offset + 1;
            self.delivered += 1;
            self.pending.insert(message.partition, position);
            if self.advance(message.partition, position) {
                exhausted = true;
            } else if self.delivered % self.progress_interval == 0 {
                self.progress
                    .report(BTreeMap::from([(message.partition, position)]));
            }
            delivered.push(message);
        }

        for (partition, position) in polled.end_of_partition {
            if self.skip_to_end(partition, position) {
                exhausted = true;
            }
        }

        if exhausted {
            let active = self.active_partitions();
            debug!(active = ?active, "Narrowing subscription");
            self.client.assign(&self.topic, &active)?;
        }

        Ok(delivered)
    }

    /// Move an Active partition to the end position its journal reported,
    /// capped at the ceiling. Returns true when this exhausted it.
    fn skip_to_end(&mut self, partition: PartitionId, position: Offset) -> bool {
        if self.state(partition) != Some(PartitionState::Active) {
            return false;
        }
        let Some(high) = self.ranges.get(partition).map(|r| r.high) else {
            return false;
        };
        let position = position.min(high);
        if self.position(partition).is_some_and(|current| current >= position) {
            return false;
        }

        trace!(partition, position, "Skipping undelivered offsets at end of partition");
        self.pending.insert(partition, position);
        self.advance(partition, position)
    }

    /// Commit the positions of everything delivered since the last commit
    pub fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.client.commit(&self.topic, &self.pending)?;
        trace!(positions = ?self.pending, "Committed positions");
        self.pending.clear();
        Ok(())
    }
}
