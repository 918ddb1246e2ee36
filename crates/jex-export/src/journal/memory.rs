//! In-process journal
//!
//! Holds topics, partitions and per-group committed offsets in memory. It can
//! be filled programmatically or loaded from a replay directory laid out as
//! `{dir}/{topic}/part-{n}.jsonl`, one message value per line.

use jex_common::{JexError, Offset, PartitionId, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::{JournalClient, JournalFactory, JournalMessage, JournalMetadata, JournalPoll};

/// Messages are kept in offset order; offsets may have gaps where records
/// were written but are never delivered
#[derive(Debug, Default)]
struct MemoryPartition {
    low: Offset,
    high: Offset,
    messages: Vec<JournalMessage>,
}

impl MemoryPartition {
    fn read_from(&self, position: Offset, max: usize) -> &[JournalMessage] {
        let start = self.messages.partition_point(|m| m.offset < position);
        let end = (start + max).min(self.messages.len());
        &self.messages[start..end]
    }

    /// Whether no message is left at or after `position`
    fn is_drained_at(&self, position: Offset) -> bool {
        self.messages.last().map_or(true, |m| m.offset < position)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    topics: HashMap<String, BTreeMap<PartitionId, MemoryPartition>>,
    committed: HashMap<(String, String, PartitionId), Offset>,
    unreachable: bool,
}

impl MemoryState {
    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(JexError::journal("broker unreachable"));
        }
        Ok(())
    }

    fn partition(&self, topic: &str, partition: PartitionId) -> Result<&MemoryPartition> {
        self.topics
            .get(topic)
            .ok_or_else(|| JexError::journal(format!("unknown topic '{}'", topic)))?
            .get(&partition)
            .ok_or_else(|| {
                JexError::journal(format!("unknown partition {} of topic '{}'", partition, topic))
            })
    }

    fn partition_mut(&mut self, topic: &str, partition: PartitionId) -> &mut MemoryPartition {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .entry(partition)
            .or_default()
    }
}

/// Shared handle on an in-memory journal. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| JexError::journal(format!("journal state poisoned: {}", e)))
    }

    /// Create `topic` with `partitions` empty partitions numbered from 0
    pub fn create_topic(&self, topic: &str, partitions: i32) -> Result<()> {
        let mut state = self.lock()?;
        for partition in 0..partitions {
            state.partition_mut(topic, partition);
        }
        Ok(())
    }

    /// Append a message and return its offset
    pub fn produce(
        &self,
        topic: &str,
        partition: PartitionId,
        key: Option<&[u8]>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Offset> {
        let mut state = self.lock()?;
        let part = state.partition_mut(topic, partition);
        let offset = part.high;
        part.messages.push(JournalMessage {
            partition,
            offset,
            key: key.map(<[u8]>::to_vec),
            value: value.into(),
        });
        part.high += 1;
        Ok(offset)
    }

    /// Take up `count` offsets with records no consumer is handed, the way
    /// transaction markers occupy offsets of a Kafka log
    pub fn skip(&self, topic: &str, partition: PartitionId, count: Offset) -> Result<()> {
        let mut state = self.lock()?;
        state.partition_mut(topic, partition).high += count.max(0);
        Ok(())
    }

    /// Drop every message below `low`, as retention would
    pub fn truncate(&self, topic: &str, partition: PartitionId, low: Offset) -> Result<()> {
        let mut state = self.lock()?;
        let part = state.partition_mut(topic, partition);
        if low <= part.low {
            return Ok(());
        }
        part.messages.retain(|m| m.offset >= low);
        part.low = low;
        part.high = part.high.max(low);
        Ok(())
    }

    pub fn set_committed(
        &self,
        group_id: &str,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<()> {
        let mut state = self.lock()?;
        state
            .committed
            .insert((group_id.to_string(), topic.to_string(), partition), offset);
        Ok(())
    }

    pub fn committed_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: PartitionId,
    ) -> Result<Option<Offset>> {
        let state = self.lock()?;
        Ok(state
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied())
    }

    /// Make every subsequent metadata or client call fail
    pub fn set_unreachable(&self, unreachable: bool) -> Result<()> {
        self.lock()?.unreachable = unreachable;
        Ok(())
    }

    /// Load a replay directory: each `{topic}/part-{n}.jsonl` file becomes
    /// partition `n` of `topic`, each non-empty line one message.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let journal = MemoryJournal::new();

        for topic_entry in std::fs::read_dir(dir)? {
            let topic_entry = topic_entry?;
            if !topic_entry.file_type()?.is_dir() {
                continue;
            }
            let topic = topic_entry.file_name().to_string_lossy().to_string();

            for part_entry in std::fs::read_dir(topic_entry.path())? {
                let path = part_entry?.path();
                let Some(partition) = parse_partition_file(&path) else {
                    debug!(path = %path.display(), "Skipping non-partition file");
                    continue;
                };
                journal.lock()?.partition_mut(&topic, partition);
                let content = std::fs::read_to_string(&path)?;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    journal.produce(&topic, partition, None, line.as_bytes())?;
                }
            }
        }

        info!(dir = %dir.display(), "Loaded replay journal");
        Ok(journal)
    }
}

fn parse_partition_file(path: &Path) -> Option<PartitionId> {
    if path.extension()? != "jsonl" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("part-")?
        .parse()
        .ok()
}

impl JournalMetadata for MemoryJournal {
    fn partitions(&self, topic: &str) -> Result<Vec<PartitionId>> {
        let state = self.lock()?;
        state.check_reachable()?;
        state
            .topics
            .get(topic)
            .map(|parts| parts.keys().copied().collect())
            .ok_or_else(|| JexError::journal(format!("unknown topic '{}'", topic)))
    }

    fn watermarks(&self, topic: &str, partition: PartitionId) -> Result<(Offset, Offset)> {
        let state = self.lock()?;
        state.check_reachable()?;
        let part = state.partition(topic, partition)?;
        Ok((part.low, part.high))
    }
}

impl JournalFactory for MemoryJournal {
    fn metadata(&self) -> Result<Arc<dyn JournalMetadata>> {
        self.lock()?.check_reachable()?;
        Ok(Arc::new(self.clone()))
    }

    fn client(&self, group_id: &str) -> Result<Box<dyn JournalClient>> {
        self.lock()?.check_reachable()?;
        Ok(Box::new(MemoryClient {
            journal: self.clone(),
            group_id: group_id.to_string(),
            topic: None,
            positions: BTreeMap::new(),
            cursor: 0,
        }))
    }
}

/// Consumer over a [`MemoryJournal`]
struct MemoryClient {
    journal: MemoryJournal,
    group_id: String,
    topic: Option<String>,
    /// Assigned partitions and their position (next offset to read)
    positions: BTreeMap<PartitionId, Offset>,
    cursor: usize,
}

impl JournalClient for MemoryClient {
    fn assign(&mut self, topic: &str, partitions: &[PartitionId]) -> Result<()> {
        let state = self.journal.lock()?;
        state.check_reachable()?;

        let mut positions = BTreeMap::new();
        for &partition in partitions {
            let part = state.partition(topic, partition)?;
            let position = match self.positions.get(&partition) {
                Some(&current) if self.topic.as_deref() == Some(topic) => current,
                _ => state
                    .committed
                    .get(&(self.group_id.clone(), topic.to_string(), partition))
                    .copied()
                    .unwrap_or(part.low),
            };
            positions.insert(partition, position);
        }

        self.topic = Some(topic.to_string());
        self.positions = positions;
        Ok(())
    }

    fn committed(
        &mut self,
        topic: &str,
        partitions: &[PartitionId],
    ) -> Result<Vec<(PartitionId, Option<Offset>)>> {
        let state = self.journal.lock()?;
        state.check_reachable()?;
        Ok(partitions
            .iter()
            .map(|&p| {
                let committed = state
                    .committed
                    .get(&(self.group_id.clone(), topic.to_string(), p))
                    .copied();
                (p, committed)
            })
            .collect())
    }

    fn poll(&mut self, max_messages: usize, timeout: Duration) -> Result<JournalPoll> {
        let polled = {
            let state = self.journal.lock()?;
            state.check_reachable()?;

            let Some(topic) = self.topic.as_deref() else {
                return Ok(JournalPoll::default());
            };

            let partitions: Vec<PartitionId> = self.positions.keys().copied().collect();
            let mut polled = JournalPoll::default();
            for i in 0..partitions.len() {
                if polled.messages.len() >= max_messages {
                    break;
                }
                let partition = partitions[(self.cursor + i) % partitions.len()];
                let mut position = self.positions[&partition];
                let part = state.partition(topic, partition)?;
                let messages = part.read_from(position, max_messages - polled.messages.len());
                if let Some(last) = messages.last() {
                    position = last.offset + 1;
                }
                polled.messages.extend_from_slice(messages);
                if part.is_drained_at(position) {
                    position = position.max(part.high);
                    polled.end_of_partition.push((partition, position));
                }
                self.positions.insert(partition, position);
            }
            self.cursor = self.cursor.wrapping_add(1);
            polled
        };

        if polled.messages.is_empty() && !self.positions.is_empty() {
            std::thread::sleep(timeout);
        }
        Ok(polled)
    }

    fn commit(&mut self, topic: &str, positions: &BTreeMap<PartitionId, Offset>) -> Result<()> {
        let mut state = self.journal.lock()?;
        state.check_reachable()?;
        for (&partition, &offset) in positions {
            state
                .committed
                .insert((self.group_id.clone(), topic.to_string(), partition), offset);
        }
        Ok(())
    }
}
