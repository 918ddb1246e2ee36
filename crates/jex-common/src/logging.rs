//! Tracing setup for the JEX binaries
//!
//! Console logs go to stderr so that commands printing JSON on stdout stay
//! pipeable. When a log directory is configured, a second non-blocking layer
//! writes daily-rotated files there. Workers run on blocking threads, so
//! thread names are always recorded.
//!
//! Components log with structured fields:
//!
//! ```rust,ignore
//! use tracing::{info, warn};
//!
//! info!(worker = 3, partitions = ?assignment, "Starting export worker");
//! warn!(partition = 7, position = 1200, "Partition exhausted");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use jex_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("Export started");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let level = Level::from_str(s.trim()).map_err(|_| anyhow!("Invalid log level: {}", s))?;
        [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ]
        .into_iter()
        .find(|l| Level::from(*l) == level)
        .ok_or_else(|| anyhow!("Invalid log level: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Write to stderr
    pub console: bool,
    /// Also write daily files `{log_dir}/{log_file_prefix}.YYYY-MM-DD`
    pub log_dir: Option<PathBuf>,
    pub log_file_prefix: String,
    /// Extra per-target directives, e.g. `jex_export::consumer=trace`
    pub filter_directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            console: true,
            log_dir: None,
            log_file_prefix: "jex".to_string(),
            filter_directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Defaults overridden by `JEX_LOG_LEVEL`, `JEX_LOG_FORMAT`,
    /// `JEX_LOG_CONSOLE`, `JEX_LOG_DIR` and `JEX_LOG_FILTER`
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env("JEX_LOG_LEVEL") {
            self.level = level.parse()?;
        }
        if let Some(format) = env("JEX_LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(console) = env("JEX_LOG_CONSOLE") {
            self.console = console
                .parse()
                .map_err(|_| anyhow!("Invalid JEX_LOG_CONSOLE value '{}'", console))?;
        }
        if let Some(dir) = env("JEX_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(filter) = env("JEX_LOG_FILTER") {
            self.filter_directives.extend(split_directives(&filter));
        }
        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Base level, then `RUST_LOG`, then the configured directives
    fn env_filter(&self) -> Result<EnvFilter> {
        let base: Directive = LevelFilter::from_level(self.level.into()).into();
        let mut filter = EnvFilter::builder()
            .with_default_directive(base)
            .from_env_lossy();
        for directive in &self.filter_directives {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Failed to parse filter directive '{}'", directive))?,
            );
        }
        Ok(filter)
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn split_directives(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn console(mut self, console: bool) -> Self {
        self.config.console = console;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(dir.into());
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    /// Comma-separated directives
    pub fn filter(mut self, directives: &str) -> Self {
        self.config.filter_directives.extend(split_directives(directives));
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Hold until exit: dropping it flushes and stops the file writer
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_thread_names(true);
    match format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().with_current_span(true).boxed(),
    }
}

/// Install the global subscriber; fails if one is already installed
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.console {
        layers.push(layer(config.format, std::io::stderr, true));
    }
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, &config.log_file_prefix));
        layers.push(layer(config.format, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter()?)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: file_guard })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
    }

    #[test]
    fn test_builder_splits_directives() {
        let config = LogConfig::builder()
            .level(LogLevel::Debug)
            .format(LogFormat::Json)
            .log_file_prefix("jex-export")
            .filter("jex_export::consumer=trace, ,rusqlite=warn")
            .build();

        assert_eq!(config.filter_directives, vec!["jex_export::consumer=trace", "rusqlite=warn"]);
        assert!(config.console);
        assert!(config.log_dir.is_none());
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_bad_directive_is_reported() {
        let config = LogConfig::builder().filter("jex_export=notalevel").build();
        let err = config.env_filter().unwrap_err();
        assert!(err.to_string().contains("jex_export=notalevel"));
    }
}
