//! Exporter interface
//!
//! Exporters receive every newly seen object of a run. Each worker builds its
//! own exporter instances through the configured factories, so an exporter
//! is only ever driven from one thread.

pub mod jsonl;

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

use crate::object::ObjectType;

pub use jsonl::{JsonlExporter, JsonlExporterFactory};

/// Destination of exported objects
pub trait Exporter: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Acquire resources before the first object
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Export one normalized object
    fn process_object(&mut self, object_type: ObjectType, object: &Value) -> Result<()>;

    /// Release resources; called once, on every exit path of the worker
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds one exporter per worker
pub trait ExporterFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, worker: usize) -> Result<Box<dyn Exporter>>;
}

/// The opened exporters of one worker.
///
/// Dropping the set closes every exporter; close failures are logged.
pub struct ExporterSet {
    exporters: Vec<Box<dyn Exporter>>,
    errors: u64,
}

impl ExporterSet {
    /// Build and open one exporter per factory. Exporters opened before a
    /// failure are closed again.
    pub fn open(factories: &[Arc<dyn ExporterFactory>], worker: usize) -> Result<Self> {
        let mut set = Self {
            exporters: Vec::with_capacity(factories.len()),
            errors: 0,
        };

        for factory in factories {
            let mut exporter = factory
                .build(worker)
                .with_context(|| format!("Failed to build exporter '{}'", factory.name()))?;
            exporter
                .open()
                .with_context(|| format!("Failed to open exporter '{}'", exporter.name()))?;
            debug!(worker, exporter = %exporter.name(), "Opened exporter");
            set.exporters.push(exporter);
        }

        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    /// Errors caught so far
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Hand `object` to every exporter in order. A failing exporter is logged
    /// and skipped; the others still receive the object.
    pub fn process_object(&mut self, object_type: ObjectType, object: &Value) {
        for exporter in &mut self.exporters {
            if let Err(e) = exporter.process_object(object_type, object) {
                self.errors += 1;
                error!(
                    exporter = %exporter.name(),
                    object_type = %object_type,
                    object = %object,
                    error = %format!("{:#}", e),
                    "Exporter failed to process object"
                );
            }
        }
    }

    fn close_all(&mut self) {
        for mut exporter in self.exporters.drain(..) {
            if let Err(e) = exporter.close() {
                error!(exporter = %exporter.name(), error = %format!("{:#}", e), "Failed to close exporter");
            }
        }
    }
}

impl Drop for ExporterSet {
    fn drop(&mut self) {
        self.close_all();
    }
}
