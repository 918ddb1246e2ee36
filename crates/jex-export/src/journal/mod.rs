//! Message journal capabilities
//!
//! The export core only needs a handful of primitives from the log-structured
//! broker it reads from: partition metadata and watermarks, manual partition
//! assignment, committed offsets of a consumer group, polling and committing.
//! Any journal offering them can back an export.

pub mod memory;
#[cfg(feature = "kafka")]
pub mod kafka;

use jex_common::{Offset, PartitionId, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryJournal;
#[cfg(feature = "kafka")]
pub use kafka::KafkaJournal;

/// A raw message read from one partition of the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalMessage {
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// What one poll saw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalPoll {
    pub messages: Vec<JournalMessage>,
    /// Partitions found at their end, with the position reached. The position
    /// can lie past the last delivered offset when the log ends with records
    /// that are never delivered, such as transaction markers.
    pub end_of_partition: Vec<(PartitionId, Offset)>,
}

/// Read-only metadata queries, shareable across threads
pub trait JournalMetadata: Send + Sync {
    /// All partition ids of `topic`
    fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>>;

    /// `(low, high)` watermark offsets of one partition
    fn watermarks(&self, topic: &str, partition: PartitionId) -> Result<(Offset, Offset)>;
}

/// A consumer bound to one consumer group.
///
/// Clients are owned by a single worker and never shared.
pub trait JournalClient: Send {
    /// Replace the assignment with exactly `partitions`. Partitions that were
    /// already assigned keep their current position; new ones start from the
    /// committed offset of the group, or the low watermark.
    fn assign(&mut self, topic: &str, partitions: &[PartitionId]) -> Result<()>;

    /// Committed offset of the group for each partition, `None` when the
    /// group never committed on it
    fn committed(
        &mut self,
        topic: &str,
        partitions: &[PartitionId],
    ) -> Result<Vec<(PartitionId, Option<Offset>)>>;

    /// Next messages of the assigned partitions, in log order per partition,
    /// and the partitions that reached their end. Blocks at most `timeout`
    /// when nothing is available.
    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<JournalPoll>;

    /// Commit consumer positions (next offset to read) for the group
    fn commit(&mut self, topic: &str, positions: &BTreeMap<PartitionId, Offset>) -> Result<()>;
}

/// Entry point of a journal backend
pub trait JournalFactory: Send + Sync {
    fn metadata(&self) -> Result<Arc<dyn JournalMetadata>>;

    fn client(&self, group_id: &str) -> Result<Box<dyn JournalClient>>;
}
