//! JEX Export - parallel journal export tool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jex_common::logging::{init_logging, LogConfig, LogLevel};
use jex_export::config::{ExportConfig, JournalBackend};
use jex_export::exporter::{ExporterFactory, JsonlExporterFactory};
use jex_export::nodeset::ShardPolicy;
use jex_export::{ObjectType, ParallelJournalExporter};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "jex-export")]
#[command(author, version, about = "Parallel journal export tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "JEX_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export every object of one type
    Run(ExportArgs),

    /// Print the probed offset ranges and the partition assignment as JSON
    Offsets(ExportArgs),
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Object type to export
    #[arg(short = 't', long)]
    object_type: Option<ObjectType>,

    /// Export identifier
    #[arg(short, long)]
    export_id: Option<String>,

    /// Number of parallel workers
    #[arg(short, long)]
    processes: Option<usize>,

    /// Root directory of the node sets
    #[arg(long)]
    node_sets_path: Option<PathBuf>,

    /// Node set sharding: single or prefix
    #[arg(long)]
    shard_policy: Option<ShardPolicy>,

    /// Journal backend: replay or kafka
    #[arg(long)]
    backend: Option<JournalBackend>,

    /// Replay directory for the replay backend
    #[arg(long)]
    replay_dir: Option<PathBuf>,

    /// Kafka bootstrap servers
    #[arg(long)]
    brokers: Option<String>,

    /// Output directory of the JSON-lines exporter
    #[arg(short = 'o', long)]
    export_dir: Option<PathBuf>,

    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,
}

impl ExportArgs {
    fn apply(self, mut config: ExportConfig) -> ExportConfig {
        if let Some(v) = self.object_type {
            config.object_type = Some(v);
        }
        if let Some(v) = self.export_id {
            config.export_id = v;
        }
        if let Some(v) = self.processes {
            config.processes = v;
        }
        if let Some(v) = self.node_sets_path {
            config.node_sets_path = v;
        }
        if let Some(v) = self.shard_policy {
            config.shard_policy = v;
        }
        if let Some(v) = self.backend {
            config.journal.backend = v;
        }
        if let Some(v) = self.replay_dir {
            config.journal.replay_dir = Some(v);
        }
        if let Some(v) = self.brokers {
            config.journal.brokers = v;
        }
        if let Some(v) = self.export_dir {
            config.export_dir = v;
        }
        if self.no_progress {
            config.show_progress = false;
        }
        config
    }
}

fn load_config(path: Option<&PathBuf>, args: ExportArgs) -> Result<ExportConfig> {
    dotenvy::dotenv().ok();
    let config = match path {
        Some(path) => ExportConfig::from_toml_file(path)?,
        None => ExportConfig::default(),
    };
    let config = args.apply(config.merge_env()?);
    config.validate().context("Invalid export configuration")?;
    Ok(config)
}

fn build_exporter(config: ExportConfig) -> Result<ParallelJournalExporter> {
    let journal = config.journal.connect()?;
    let exporters: Vec<Arc<dyn ExporterFactory>> = vec![Arc::new(JsonlExporterFactory::new(&config.export_dir))];
    ParallelJournalExporter::new(config, journal, exporters)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("jex-export")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run(args) => {
            let config = load_config(cli.config.as_ref(), args)?;
            info!(
                object_type = ?config.object_type,
                export_id = %config.export_id,
                processes = config.processes,
                "Starting journal export"
            );
            let mut exporter = build_exporter(config)?;
            let summary = exporter.run().await?;
            info!(
                exported = summary.exported(),
                duplicates = summary.duplicates(),
                exporter_errors = summary.exporter_errors(),
                "Export complete"
            );
        },
        Command::Offsets(args) => {
            let config = load_config(cli.config.as_ref(), args)?;
            let exporter = build_exporter(config)?;
            let ranges = exporter.offsets().await?;
            let assignment = exporter.assignment().await?;
            let report = json!({
                "topic": exporter.topic(),
                "group_id": exporter.group_id(),
                "total": ranges.total(),
                "partitions": ranges.iter().collect::<Vec<_>>(),
                "assignment": assignment,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
    }

    Ok(())
}
