//! Export configuration
//!
//! Values come from, in increasing precedence: defaults, an optional TOML
//! file, `JEX_*` environment variables (a `.env` file is honoured) and
//! command line flags.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::journal::{JournalFactory, MemoryJournal};
use crate::nodeset::ShardPolicy;
use crate::object::ObjectType;

pub const DEFAULT_GROUP_PREFIX: &str = "jex-export";
pub const DEFAULT_TOPIC_PREFIX: &str = "jex.journal.objects";
pub const DEFAULT_BROKERS: &str = "localhost:9092";
pub const DEFAULT_PROCESSES: usize = 4;
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 200;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_JOURNAL_TIMEOUT_SECS: u64 = 30;

/// Where messages are read from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalBackend {
    /// Local replay directory of `{topic}/part-{n}.jsonl` files
    #[default]
    Replay,
    Kafka,
}

impl FromStr for JournalBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "replay" => Ok(JournalBackend::Replay),
            "kafka" => Ok(JournalBackend::Kafka),
            other => bail!("unknown journal backend '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub backend: JournalBackend,
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Topics are named `{topic_prefix}.{object_type}`
    pub topic_prefix: String,
    /// Extra librdkafka properties
    pub properties: BTreeMap<String, String>,
    pub replay_dir: Option<PathBuf>,
    /// Timeout of metadata and committed-offset queries
    pub timeout_secs: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            backend: JournalBackend::default(),
            brokers: DEFAULT_BROKERS.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            properties: BTreeMap::new(),
            replay_dir: None,
            timeout_secs: DEFAULT_JOURNAL_TIMEOUT_SECS,
        }
    }
}

impl JournalConfig {
    /// Open the configured journal backend
    pub fn connect(&self) -> Result<Arc<dyn JournalFactory>> {
        match self.backend {
            JournalBackend::Replay => {
                let dir = self
                    .replay_dir
                    .as_ref()
                    .context("JEX_REPLAY_DIR is required for the replay journal")?;
                let journal = MemoryJournal::from_dir(dir)
                    .with_context(|| format!("Failed to load replay journal from {}", dir.display()))?;
                Ok(Arc::new(journal))
            },
            #[cfg(feature = "kafka")]
            JournalBackend::Kafka => Ok(Arc::new(crate::journal::KafkaJournal::new(
                self.brokers.clone(),
                self.properties.clone(),
                Duration::from_secs(self.timeout_secs),
            ))),
            #[cfg(not(feature = "kafka"))]
            JournalBackend::Kafka => bail!("jex-export was built without the `kafka` feature"),
        }
    }
}

/// Configuration of one export run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub object_type: Option<ObjectType>,
    /// Identifies the export; node sets and committed offsets are scoped to it
    pub export_id: String,
    pub group_prefix: String,
    /// Number of parallel workers
    pub processes: usize,
    /// Messages between two progress reports of a worker
    pub progress_interval: u64,
    /// Maximum messages per poll
    pub batch_size: usize,
    pub poll_timeout_ms: u64,
    pub node_sets_path: PathBuf,
    pub shard_policy: ShardPolicy,
    pub show_progress: bool,
    pub journal: JournalConfig,
    /// Output directory of the JSON-lines exporter
    pub export_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            object_type: None,
            export_id: String::new(),
            group_prefix: DEFAULT_GROUP_PREFIX.to_string(),
            processes: DEFAULT_PROCESSES,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            node_sets_path: PathBuf::from("node-sets"),
            shard_policy: ShardPolicy::default(),
            show_progress: true,
            journal: JournalConfig::default(),
            export_dir: PathBuf::from("export"),
        }
    }
}

fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, name, e)),
        _ => Ok(None),
    }
}

impl ExportConfig {
    /// Defaults overridden by the environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::default().merge_env()
    }

    /// Load a TOML file; missing keys keep their defaults
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Override fields with the `JEX_*` variables that are set
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(v) = env_var::<String>("JEX_OBJECT_TYPE")? {
            self.object_type = Some(v.parse()?);
        }
        if let Some(v) = env_var("JEX_EXPORT_ID")? {
            self.export_id = v;
        }
        if let Some(v) = env_var("JEX_GROUP_PREFIX")? {
            self.group_prefix = v;
        }
        if let Some(v) = env_var("JEX_PROCESSES")? {
            self.processes = v;
        }
        if let Some(v) = env_var("JEX_PROGRESS_INTERVAL")? {
            self.progress_interval = v;
        }
        if let Some(v) = env_var("JEX_BATCH_SIZE")? {
            self.batch_size = v;
        }
        if let Some(v) = env_var("JEX_POLL_TIMEOUT_MS")? {
            self.poll_timeout_ms = v;
        }
        if let Some(v) = env_var("JEX_NODE_SETS_PATH")? {
            self.node_sets_path = v;
        }
        if let Some(v) = env_var("JEX_SHARD_POLICY")? {
            self.shard_policy = v;
        }
        if let Some(v) = env_var("JEX_SHOW_PROGRESS")? {
            self.show_progress = v;
        }
        if let Some(v) = env_var("JEX_EXPORT_DIR")? {
            self.export_dir = v;
        }
        if let Some(v) = env_var("JEX_JOURNAL_BACKEND")? {
            self.journal.backend = v;
        }
        if let Some(v) = env_var("JEX_BROKERS")? {
            self.journal.brokers = v;
        }
        if let Some(v) = env_var("JEX_TOPIC_PREFIX")? {
            self.journal.topic_prefix = v;
        }
        if let Some(v) = env_var("JEX_REPLAY_DIR")? {
            self.journal.replay_dir = Some(v);
        }
        if let Some(v) = env_var("JEX_JOURNAL_TIMEOUT_SECS")? {
            self.journal.timeout_secs = v;
        }
        Ok(self)
    }

    /// Validate the configuration, journal settings included
    pub fn validate(&self) -> Result<()> {
        self.validate_run()?;
        match self.journal.backend {
            JournalBackend::Kafka if self.journal.brokers.trim().is_empty() => {
                bail!("JEX_BROKERS must be set for the kafka journal")
            },
            JournalBackend::Replay if self.journal.replay_dir.is_none() => {
                bail!("JEX_REPLAY_DIR must be set for the replay journal")
            },
            _ => Ok(()),
        }
    }

    /// Validate the settings of the export itself, whatever the journal
    pub fn validate_run(&self) -> Result<()> {
        if self.object_type.is_none() {
            bail!("JEX_OBJECT_TYPE must be set");
        }
        if self.export_id.trim().is_empty() {
            bail!("JEX_EXPORT_ID must be set");
        }
        if self.processes == 0 {
            bail!("JEX_PROCESSES must be greater than 0");
        }
        if self.batch_size == 0 {
            bail!("JEX_BATCH_SIZE must be greater than 0");
        }
        if self.progress_interval == 0 {
            bail!("JEX_PROGRESS_INTERVAL must be greater than 0");
        }
        Ok(())
    }

    pub fn require_object_type(&self) -> Result<ObjectType> {
        self.object_type.context("JEX_OBJECT_TYPE must be set")
    }

    /// `{topic_prefix}.{object_type}`
    pub fn topic(&self) -> Result<String> {
        Ok(format!("{}.{}", self.journal.topic_prefix, self.require_object_type()?))
    }

    /// Consumer group of the export: `{group_prefix}-{export_id}`
    pub fn group_id(&self) -> String {
        format!("{}-{}", self.group_prefix, self.export_id)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "JEX_OBJECT_TYPE",
        "JEX_EXPORT_ID",
        "JEX_PROCESSES",
        "JEX_SHARD_POLICY",
        "JEX_JOURNAL_BACKEND",
        "JEX_REPLAY_DIR",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn valid() -> ExportConfig {
        ExportConfig {
            object_type: Some(ObjectType::Revision),
            export_id: "2024-01".to_string(),
            journal: JournalConfig {
                replay_dir: Some(PathBuf::from("/tmp/replay")),
                ..JournalConfig::default()
            },
            ..ExportConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ExportConfig::default();
        assert_eq!(config.group_prefix, "jex-export");
        assert_eq!(config.progress_interval, 200);
        assert_eq!(config.shard_policy, ShardPolicy::Single);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topic_and_group_id() {
        let config = valid();
        config.validate().unwrap();
        assert_eq!(config.topic().unwrap(), "jex.journal.objects.revision");
        assert_eq!(config.group_id(), "jex-export-2024-01");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = valid();
        config.processes = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.export_id = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.journal.replay_dir = None;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.journal.backend = JournalBackend::Kafka;
        config.journal.replay_dir = None;
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("JEX_OBJECT_TYPE", "origin_visit");
        std::env::set_var("JEX_EXPORT_ID", "e1");
        std::env::set_var("JEX_PROCESSES", "8");
        std::env::set_var("JEX_SHARD_POLICY", "prefix");

        let config = ExportConfig::default().merge_env().unwrap();
        assert_eq!(config.object_type, Some(ObjectType::OriginVisit));
        assert_eq!(config.export_id, "e1");
        assert_eq!(config.processes, 8);
        assert_eq!(config.shard_policy, ShardPolicy::Prefix);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_reported() {
        clear_env();
        std::env::set_var("JEX_PROCESSES", "many");
        let err = ExportConfig::default().merge_env().unwrap_err();
        assert!(err.to_string().contains("JEX_PROCESSES"));

        clear_env();
        std::env::set_var("JEX_OBJECT_TYPE", "tarball");
        assert!(ExportConfig::default().merge_env().is_err());
        clear_env();
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.toml");
        std::fs::write(
            &path,
            r#"
object_type = "snapshot"
export_id = "nightly"
processes = 2
shard_policy = "prefix"

[journal]
backend = "kafka"
brokers = "broker-1:9092,broker-2:9092"

[journal.properties]
"security.protocol" = "SASL_SSL"
"#,
        )
        .unwrap();

        let config = ExportConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.object_type, Some(ObjectType::Snapshot));
        assert_eq!(config.processes, 2);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.journal.backend, JournalBackend::Kafka);
        assert_eq!(config.journal.properties["security.protocol"], "SASL_SSL");
        config.validate().unwrap();
    }

    #[test]
    fn test_replay_backend_requires_directory() {
        let config = JournalConfig::default();
        assert!(config.connect().is_err());
    }
}
