//! JSON-lines exporter
//!
//! Every worker writes its own file `{export_dir}/{object_type}/{uuid}.jsonl`,
//! one normalized object per line.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use super::{Exporter, ExporterFactory};
use crate::object::ObjectType;

pub struct JsonlExporter {
    name: String,
    export_dir: PathBuf,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl JsonlExporter {
    pub fn new(export_dir: impl Into<PathBuf>, worker: usize) -> Self {
        Self {
            name: format!("jsonl-{}", worker),
            export_dir: export_dir.into(),
            path: None,
            writer: None,
            written: 0,
        }
    }

    /// Objects written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    fn writer(&mut self, object_type: ObjectType) -> Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let dir = self.export_dir.join(object_type.as_str());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create export directory {}", dir.display()))?;
            let path = dir.join(format!("{}.jsonl", Uuid::new_v4()));
            let file = File::create(&path)
                .with_context(|| format!("Failed to create export file {}", path.display()))?;
            self.writer = Some(BufWriter::new(file));
            self.path = Some(path);
        }
        self.writer
            .as_mut()
            .context("Export file is not open")
    }
}

impl Exporter for JsonlExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_object(&mut self, object_type: ObjectType, object: &Value) -> Result<()> {
        let writer = self.writer(object_type)?;
        serde_json::to_writer(&mut *writer, object)?;
        writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("Failed to flush export file")?;
            if let Some(path) = &self.path {
                info!(path = %path.display(), objects = self.written, "Closed export file");
            }
        }
        Ok(())
    }
}

pub struct JsonlExporterFactory {
    export_dir: PathBuf,
}

impl JsonlExporterFactory {
    pub fn new(export_dir: impl AsRef<Path>) -> Self {
        Self {
            export_dir: export_dir.as_ref().to_path_buf(),
        }
    }
}

impl ExporterFactory for JsonlExporterFactory {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn build(&self, worker: usize) -> Result<Box<dyn Exporter>> {
        Ok(Box::new(JsonlExporter::new(&self.export_dir, worker)))
    }
}
