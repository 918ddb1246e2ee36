//! JEX Export Library
//!
//! Parallel export of the objects stored in a partitioned message journal.
//!
//! A run captures the watermarks of every partition of the object type's
//! topic, stripes the non-empty partitions over a pool of workers and lets
//! each worker consume its partitions up to those watermarks. Every object is
//! identified by a digest; a persistent node set per partition makes sure an
//! object is handed to the exporters once per export, across restarts.
//!
//! # Example
//!
//! ```no_run
//! use jex_export::config::ExportConfig;
//! use jex_export::exporter::{ExporterFactory, JsonlExporterFactory};
//! use jex_export::ParallelJournalExporter;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ExportConfig::from_env()?;
//!     let journal = config.journal.connect()?;
//!     let exporters: Vec<Arc<dyn ExporterFactory>> =
//!         vec![Arc::new(JsonlExporterFactory::new(&config.export_dir))];
//!
//!     let mut exporter = ParallelJournalExporter::new(config, journal, exporters)?;
//!     let summary = exporter.run().await?;
//!     println!("exported {} objects", summary.exported());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod consumer;
pub mod exporter;
pub mod journal;
pub mod nodeset;
pub mod object;
pub mod offsets;
pub mod processor;
pub mod progress;
pub mod worker;

pub use consumer::{BoundedConsumer, PartitionState};
pub use exporter::{Exporter, ExporterFactory};
pub use journal::{JournalClient, JournalFactory, JournalMessage, JournalMetadata};
pub use nodeset::{NodeSets, NodeStore, ShardPolicy, SqliteNodeSet};
pub use object::ObjectType;
pub use offsets::probe_offset_ranges;
pub use processor::{assign_partitions, ExportSummary, ParallelJournalExporter, RunState};
pub use progress::{ProgressAggregator, ProgressSnapshot};
pub use worker::{ExportWorker, WorkerStats};
