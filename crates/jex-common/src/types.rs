//! Common types shared by the journal export components

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{JexError, Result};

/// Partition identifier within a topic
pub type PartitionId = i32;

/// Offset of a message within a partition
pub type Offset = i64;

/// Watermark boundaries of one partition, captured once at the start of a run.
///
/// `low` is the oldest available offset and `high` the offset the next
/// produced message would get, so the partition holds `high - low` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionOffsetRange {
    pub partition: PartitionId,
    pub low: Offset,
    pub high: Offset,
}

impl PartitionOffsetRange {
    pub fn new(partition: PartitionId, low: Offset, high: Offset) -> Result<Self> {
        if low > high {
            return Err(JexError::journal(format!(
                "partition {} has low watermark {} above high watermark {}",
                partition, low, high
            )));
        }
        Ok(Self {
            partition,
            low,
            high,
        })
    }

    /// Number of messages inside the range
    pub fn len(&self) -> u64 {
        (self.high - self.low) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }

    /// Whether a consumer standing at `position` has read the whole range
    pub fn is_exhausted_at(&self, position: Offset) -> bool {
        position >= self.high
    }
}

/// Non-empty partition ranges of a topic, keyed and ordered by partition id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRanges {
    ranges: BTreeMap<PartitionId, PartitionOffsetRange>,
}

impl OffsetRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a partition range. Empty ranges are dropped, returns whether
    /// the range was kept.
    pub fn insert(&mut self, range: PartitionOffsetRange) -> bool {
        if range.is_empty() {
            return false;
        }
        self.ranges.insert(range.partition, range);
        true
    }

    pub fn get(&self, partition: PartitionId) -> Option<&PartitionOffsetRange> {
        self.ranges.get(&partition)
    }

    /// Sorted partition ids
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.ranges.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionOffsetRange> {
        self.ranges.values()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of messages across all partitions
    pub fn total(&self) -> u64 {
        self.ranges.values().map(PartitionOffsetRange::len).sum()
    }
}

impl FromIterator<PartitionOffsetRange> for OffsetRanges {
    fn from_iter<I: IntoIterator<Item = PartitionOffsetRange>>(iter: I) -> Self {
        let mut ranges = OffsetRanges::new();
        for range in iter {
            ranges.insert(range);
        }
        ranges
    }
}

/// Message posted by workers on the shared progress channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressMessage {
    /// Latest consumer position (next offset to read) per partition
    Offsets(BTreeMap<PartitionId, Offset>),
    /// Terminal sentinel, sent exactly once by each worker
    Done { worker: usize },
}

impl ProgressMessage {
    pub fn position(partition: PartitionId, position: Offset) -> Self {
        ProgressMessage::Offsets(BTreeMap::from([(partition, position)]))
    }
}
