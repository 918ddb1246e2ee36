//! Partition watermark probing
//!
//! The offset ranges of a run are captured once, before any worker starts:
//! messages produced afterwards are left for the next run.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use jex_common::{OffsetRanges, PartitionOffsetRange};
use tracing::{debug, info};

use crate::journal::JournalFactory;
use crate::progress::create_progress_bar;

/// Fetch the `(low, high)` watermarks of every partition of `topic`.
///
/// At most `parallelism` watermark queries run at once. Empty partitions are
/// left out of the result. Any failure fails the whole probe.
pub async fn probe_offset_ranges(
    factory: &dyn JournalFactory,
    topic: &str,
    parallelism: usize,
    show_progress: bool,
) -> Result<OffsetRanges> {
    let metadata = factory
        .metadata()
        .context("Failed to open journal metadata client")?;

    let partitions = {
        let metadata = metadata.clone();
        let owned_topic = topic.to_string();
        tokio::task::spawn_blocking(move || metadata.partitions(&owned_topic))
            .await
            .context("Partition listing task failed")?
            .with_context(|| format!("Failed to list partitions of topic '{}'", topic))?
    };
    debug!(topic = %topic, partitions = partitions.len(), "Listed topic partitions");

    let pb = create_progress_bar(partitions.len() as u64, "Partition offsets", show_progress);

    let results: Vec<Result<PartitionOffsetRange>> = stream::iter(partitions)
        .map(|partition| {
            let metadata = metadata.clone();
            let topic = topic.to_string();
            let pb = pb.clone();
            async move {
                let (low, high) = tokio::task::spawn_blocking(move || metadata.watermarks(&topic, partition))
                    .await
                    .context("Watermark task failed")?
                    .with_context(|| format!("Failed to fetch watermarks of partition {}", partition))?;
                pb.inc(1);
                Ok::<_, anyhow::Error>(PartitionOffsetRange::new(partition, low, high)?)
            }
        })
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await;
    pb.finish_and_clear();

    let mut ranges = OffsetRanges::new();
    for range in results {
        let range = range?;
        if !ranges.insert(range) {
            debug!(partition = range.partition, "Skipping empty partition");
        }
    }

    info!(
        topic = %topic,
        partitions = ranges.len(),
        total = ranges.total(),
        "Probed partition offsets"
    );
    Ok(ranges)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;

    #[tokio::test]
    async fn test_probe_excludes_empty_partitions() {
        let journal = MemoryJournal::new();
        journal.create_topic("t", 4).unwrap();
        for i in 0..100 {
            journal.produce("t", 0, None, format!("{}", i)).unwrap();
        }
        for i in 0..50 {
            journal.produce("t", 2, None, format!("{}", i)).unwrap();
        }
        journal.truncate("t", 2, 50).unwrap();
        for i in 0..10 {
            journal.produce("t", 3, None, format!("{}", i)).unwrap();
        }

        let ranges = probe_offset_ranges(&journal, "t", 2, false).await.unwrap();
        assert_eq!(ranges.partitions(), vec![0, 3]);
        assert_eq!(ranges.total(), 110);
        assert_eq!(ranges.get(0).unwrap().high, 100);
    }

    #[tokio::test]
    async fn test_probe_fails_when_journal_unreachable() {
        let journal = MemoryJournal::new();
        journal.create_topic("t", 2).unwrap();
        journal.set_unreachable(true).unwrap();
        assert!(probe_offset_ranges(&journal, "t", 4, false).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_fails_on_unknown_topic() {
        let journal = MemoryJournal::new();
        let err = probe_offset_ranges(&journal, "missing", 1, false).await.unwrap_err();
        assert!(format!("{:#}", err).contains("missing"));
    }
}
