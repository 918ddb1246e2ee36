//! Parallel journal export orchestration
//!
//! Probes the partition offsets once, stripes the non-empty partitions over
//! the configured number of workers, runs every worker on its own blocking
//! thread and aggregates their progress. The first failing worker cancels the
//! others and fails the run.

use anyhow::{anyhow, Context, Result};
use jex_common::{OffsetRanges, PartitionId};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ExportConfig;
use crate::exporter::ExporterFactory;
use crate::journal::JournalFactory;
use crate::object::ObjectType;
use crate::offsets::probe_offset_ranges;
use crate::progress::{progress_channel, ProgressAggregator, ProgressSnapshot};
use crate::worker::{ExportWorker, WorkerSettings, WorkerStats};

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Probing,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Probing => "probing",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stripe sorted partition ids over `processes` workers: worker `i` gets the
/// ids at positions `i, i + processes, i + 2 * processes, ...`
pub fn assign_partitions(partitions: &[PartitionId], processes: usize) -> Vec<Vec<PartitionId>> {
    let processes = processes.max(1);
    let mut sorted = partitions.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut assignment = vec![Vec::new(); processes];
    for (index, partition) in sorted.into_iter().enumerate() {
        assignment[index % processes].push(partition);
    }
    assignment
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub group_id: String,
    pub object_type: ObjectType,
    pub total_work: u64,
    pub progress: u64,
    pub workers: Vec<WorkerStats>,
}

impl ExportSummary {
    pub fn exported(&self) -> u64 {
        self.workers.iter().map(|w| w.objects.exported).sum()
    }

    pub fn duplicates(&self) -> u64 {
        self.workers.iter().map(|w| w.objects.duplicates).sum()
    }

    pub fn messages(&self) -> u64 {
        self.workers.iter().map(|w| w.objects.messages).sum()
    }

    pub fn exporter_errors(&self) -> u64 {
        self.workers.iter().map(|w| w.exporter_errors).sum()
    }
}

/// Exports one object type of the journal with parallel workers
pub struct ParallelJournalExporter {
    config: ExportConfig,
    object_type: ObjectType,
    topic: String,
    journal: Arc<dyn JournalFactory>,
    exporters: Vec<Arc<dyn ExporterFactory>>,
    offsets: OnceCell<Arc<OffsetRanges>>,
    state: RunState,
}

impl ParallelJournalExporter {
    pub fn new(
        config: ExportConfig,
        journal: Arc<dyn JournalFactory>,
        exporters: Vec<Arc<dyn ExporterFactory>>,
    ) -> Result<Self> {
        config.validate_run()?;
        let object_type = config.require_object_type()?;
        let topic = config.topic()?;

        Ok(Self {
            config,
            object_type,
            topic,
            journal,
            exporters,
            offsets: OnceCell::new(),
            state: RunState::Init,
        })
    }

    pub fn group_id(&self) -> String {
        self.config.group_id()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        info!(from = %self.state, to = %next, group_id = %self.group_id(), "Export state change");
        self.state = next;
    }

    /// Offset ranges of the run, probed on first call only
    pub async fn offsets(&self) -> Result<Arc<OffsetRanges>> {
        self.offsets
            .get_or_try_init(|| async {
                let ranges = probe_offset_ranges(
                    self.journal.as_ref(),
                    &self.topic,
                    self.config.processes,
                    self.config.show_progress,
                )
                .await?;
                Ok::<_, anyhow::Error>(Arc::new(ranges))
            })
            .await
            .cloned()
    }

    /// Partition assignment of the run
    pub async fn assignment(&self) -> Result<Vec<Vec<PartitionId>>> {
        let ranges = self.offsets().await?;
        Ok(assign_partitions(&ranges.partitions(), self.config.processes))
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            topic: self.topic.clone(),
            group_id: self.group_id(),
            object_type: self.object_type,
            node_sets_path: self.config.node_sets_path.clone(),
            shard_policy: self.config.shard_policy,
            batch_size: self.config.batch_size,
            poll_timeout: self.config.poll_timeout(),
            progress_interval: self.config.progress_interval,
        }
    }

    /// Run the export to completion
    pub async fn run(&mut self) -> Result<ExportSummary> {
        self.transition(RunState::Probing);
        let ranges = match self.offsets().await {
            Ok(ranges) => ranges,
            Err(e) => {
                self.transition(RunState::Failed);
                return Err(e.context(format!("Failed to probe offsets of topic '{}'", self.topic)));
            },
        };

        let assignment = assign_partitions(&ranges.partitions(), self.config.processes);
        self.transition(RunState::Running);
        info!(
            topic = %self.topic,
            partitions = ranges.len(),
            total = ranges.total(),
            workers = assignment.len(),
            "Starting parallel export"
        );

        match self.supervise(ranges, assignment).await {
            Ok(summary) => {
                self.transition(RunState::Completed);
                info!(
                    exported = summary.exported(),
                    duplicates = summary.duplicates(),
                    progress = summary.progress,
                    total = summary.total_work,
                    "Export completed"
                );
                Ok(summary)
            },
            Err(e) => {
                self.transition(RunState::Failed);
                error!(error = %format!("{:#}", e), "Export failed");
                Err(e)
            },
        }
    }

    async fn supervise(
        &self,
        ranges: Arc<OffsetRanges>,
        assignment: Vec<Vec<PartitionId>>,
    ) -> Result<ExportSummary> {
        let settings = Arc::new(self.worker_settings());
        let (progress, rx) = progress_channel();
        let aggregator = ProgressAggregator::new(ranges.clone(), assignment.len(), self.object_type.as_str());
        let aggregator = tokio::spawn(aggregator.run(rx, self.config.show_progress));

        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        for (index, partitions) in assignment.iter().enumerate() {
            let worker = ExportWorker::new(
                index,
                partitions.clone(),
                settings.clone(),
                ranges.clone(),
                self.journal.clone(),
                self.exporters.clone(),
                progress.clone(),
                cancel.clone(),
            );
            workers.spawn_blocking(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| worker.run()))
                    .unwrap_or_else(|panic| Err(anyhow!("worker panicked: {}", panic_message(&*panic))));
                (index, outcome)
            });
        }
        drop(progress);

        let mut stats = Vec::with_capacity(assignment.len());
        let mut failure: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            let (index, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Export worker task failed");
                    failure.get_or_insert(anyhow::Error::new(e).context("Export worker task failed"));
                    cancel.cancel();
                    continue;
                },
            };

            match outcome {
                Ok(worker_stats) => stats.push(worker_stats),
                Err(e) if failure.is_none() => {
                    let partitions = &assignment[index];
                    error!(worker = index, partitions = ?partitions, error = %format!("{:#}", e), "Export worker failed");
                    cancel.cancel();
                    failure = Some(e.context(format!(
                        "Export worker {} (partitions {:?}) failed",
                        index, partitions
                    )));
                },
                Err(e) => {
                    warn!(worker = index, error = %format!("{:#}", e), "Export worker stopped");
                },
            }
        }

        if let Some(e) = failure {
            aggregator.abort();
            return Err(e);
        }

        let snapshot: ProgressSnapshot = aggregator.await.context("Progress aggregator failed")?;
        stats.sort_by_key(|s| s.worker);

        Ok(ExportSummary {
            group_id: self.group_id(),
            object_type: self.object_type,
            total_work: snapshot.total,
            progress: snapshot.progress,
            workers: stats,
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
