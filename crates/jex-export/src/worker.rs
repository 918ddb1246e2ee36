//! Per-worker export loop
//!
//! A worker owns its journal client, its node sets and its exporters. It
//! polls its partitions until every one of them reaches its ceiling, and for
//! each batch: exports the new objects, flushes the node sets, then commits
//! the consumer positions.

use anyhow::{bail, Context, Result};
use jex_common::{OffsetRanges, PartitionId};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace};

use crate::consumer::BoundedConsumer;
use crate::exporter::{ExporterFactory, ExporterSet};
use crate::journal::{JournalFactory, JournalMessage};
use crate::nodeset::{NodeSets, ShardPolicy};
use crate::object::ObjectType;
use crate::progress::ProgressSender;

/// Run-wide settings shared by every worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub topic: String,
    pub group_id: String,
    pub object_type: ObjectType,
    pub node_sets_path: PathBuf,
    pub shard_policy: ShardPolicy,
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub progress_interval: u64,
}

/// Object counters of one processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    /// Messages read within the ceilings
    pub messages: u64,
    /// Objects handed to the exporters
    pub exported: u64,
    /// Objects already present in the node set
    pub duplicates: u64,
    /// Objects without an identity, or empty messages
    pub skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker: usize,
    pub partitions: Vec<PartitionId>,
    #[serde(flatten)]
    pub objects: ProcessStats,
    pub exporter_errors: u64,
}

/// Decode, deduplicate and export the objects of one worker
pub struct ObjectProcessor {
    object_type: ObjectType,
    node_sets: NodeSets,
    exporters: ExporterSet,
    stats: ProcessStats,
}

impl ObjectProcessor {
    pub fn new(object_type: ObjectType, node_sets: NodeSets, exporters: ExporterSet) -> Self {
        Self {
            object_type,
            node_sets,
            exporters,
            stats: ProcessStats::default(),
        }
    }

    pub fn stats(&self) -> ProcessStats {
        self.stats
    }

    pub fn exporter_errors(&self) -> u64 {
        self.exporters.errors()
    }

    /// Process a batch, partition by partition, in log order within each
    /// partition. A message that cannot be decoded or identified fails the
    /// whole batch.
    pub fn process_messages(&mut self, messages: &[JournalMessage]) -> Result<()> {
        let mut by_partition: BTreeMap<PartitionId, Vec<&JournalMessage>> = BTreeMap::new();
        for message in messages {
            by_partition.entry(message.partition).or_default().push(message);
        }

        for (partition, messages) in by_partition {
            for message in messages {
                self.stats.messages += 1;
                if message.value.is_empty() {
                    trace!(partition, offset = message.offset, "Skipping empty message");
                    self.stats.skipped += 1;
                    continue;
                }
                let object = self.object_type.decode(&message.value).with_context(|| {
                    format!(
                        "Malformed {} message at partition {} offset {}",
                        self.object_type, partition, message.offset
                    )
                })?;
                self.process_object(partition, object).with_context(|| {
                    format!(
                        "Failed to process {} message at partition {} offset {}",
                        self.object_type, partition, message.offset
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Export `object` unless its identity was already recorded.
    ///
    /// Returns whether the object was exported.
    pub fn process_object(&mut self, partition: PartitionId, object: Value) -> Result<bool> {
        let Some(node_id) = self.object_type.identity(&object)? else {
            self.stats.skipped += 1;
            return Ok(false);
        };

        if !self.node_sets.add(partition, node_id.as_bytes())? {
            trace!(partition, node_id = %node_id, "Skipping already exported object");
            self.stats.duplicates += 1;
            return Ok(false);
        }

        self.exporters.process_object(self.object_type, &object);
        self.stats.exported += 1;
        Ok(true)
    }

    /// Make the node-set insertions of the processed batches durable
    pub fn flush(&mut self) -> Result<()> {
        self.node_sets.flush_all().context("Failed to flush node sets")
    }

    /// Close node sets and exporters
    pub fn close(self) -> Result<()> {
        let ObjectProcessor {
            node_sets, exporters, ..
        } = self;
        drop(exporters);
        node_sets.close().context("Failed to close node sets")
    }
}

/// One parallel export worker
pub struct ExportWorker {
    worker: usize,
    partitions: Vec<PartitionId>,
    settings: Arc<WorkerSettings>,
    ranges: Arc<OffsetRanges>,
    journal: Arc<dyn JournalFactory>,
    exporters: Vec<Arc<dyn ExporterFactory>>,
    progress: ProgressSender,
    cancel: CancellationToken,
}

impl ExportWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker: usize,
        partitions: Vec<PartitionId>,
        settings: Arc<WorkerSettings>,
        ranges: Arc<OffsetRanges>,
        journal: Arc<dyn JournalFactory>,
        exporters: Vec<Arc<dyn ExporterFactory>>,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            partitions,
            settings,
            ranges,
            journal,
            exporters,
            progress,
            cancel,
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    /// Blocking: run until every assigned partition is exhausted, the worker
    /// is cancelled, or an error occurs. The worker's `Done` progress message
    /// is posted on every exit path.
    pub fn run(self) -> Result<WorkerStats> {
        let _done = self.progress.done_guard(self.worker);
        let span = info_span!("worker", worker = self.worker);
        let _entered = span.enter();
        let settings = &self.settings;

        info!(partitions = ?self.partitions, "Starting export worker");

        let exporters = ExporterSet::open(&self.exporters, self.worker)?;
        let node_sets = NodeSets::new(&settings.node_sets_path, settings.object_type, settings.shard_policy);
        let mut processor = ObjectProcessor::new(settings.object_type, node_sets, exporters);

        let client = self
            .journal
            .client(&settings.group_id)
            .context("Failed to create journal client")?;
        let mut consumer = BoundedConsumer::new(
            client,
            settings.topic.clone(),
            self.ranges.clone(),
            &self.partitions,
            self.progress.clone(),
            settings.progress_interval,
        );
        consumer.subscribe().context("Failed to subscribe to partitions")?;

        while !consumer.is_finished() {
            if self.cancel.is_cancelled() {
                bail!("Export worker {} cancelled", self.worker);
            }

            let batch = consumer
                .poll(settings.batch_size, settings.poll_timeout)
                .context("Failed to poll journal")?;
            if batch.is_empty() {
                continue;
            }
            debug!(messages = batch.len(), "Processing batch");

            processor.process_messages(&batch)?;
            processor.flush()?;
            consumer.commit().context("Failed to commit offsets")?;
        }

        let stats = WorkerStats {
            worker: self.worker,
            partitions: self.partitions.clone(),
            objects: processor.stats(),
            exporter_errors: processor.exporter_errors(),
        };
        processor.close()?;

        info!(
            messages = stats.objects.messages,
            exported = stats.objects.exported,
            duplicates = stats.objects.duplicates,
            skipped = stats.objects.skipped,
            exporter_errors = stats.exporter_errors,
            "Export worker finished"
        );
        Ok(stats)
    }
}
