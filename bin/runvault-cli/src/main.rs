//! RunVault CLI
//!
//! Feeds newline-delimited run documents through an ingestion pipeline
//! backed by on-disk volatile and permanent stores.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runvault_common::{Document, DocumentKind, PipelineConfig};
use runvault_ingest::RunPipeline;
use runvault_store::{DiskStore, DocumentStore};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "runvault")]
#[command(about = "RunVault run ingestion and freeze")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "runvault.toml", env = "RUNVAULT_CONFIG")]
    config: PathBuf,

    /// Volatile store database file
    #[arg(long)]
    volatile: Option<PathBuf>,

    /// Permanent store database file
    #[arg(long)]
    permanent: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest a file of newline-delimited `{"name": ..., "doc": ...}` documents
    Ingest {
        /// Input file
        file: PathBuf,

        /// Freeze the run even if the input ends without a stop document
        #[arg(long)]
        freeze_partial: bool,
    },
    /// Move a run left in the volatile store to the permanent store
    Freeze {
        /// Run uid
        #[arg(long)]
        run_id: String,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    pipeline: PipelineConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    #[serde(default = "default_volatile")]
    volatile: PathBuf,
    #[serde(default = "default_permanent")]
    permanent: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volatile: default_volatile(),
            permanent: default_permanent(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_volatile() -> PathBuf {
    PathBuf::from("./runvault-data/volatile.redb")
}

fn default_permanent() -> PathBuf {
    PathBuf::from("./runvault-data/permanent.redb")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&config_str)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Outcome of ingesting one input file
#[derive(Debug, Default, PartialEq, Eq)]
struct IngestSummary {
    documents: u64,
    stopped: bool,
    partial_frozen: bool,
}

fn ingest_file(pipeline: &RunPipeline, path: &Path, freeze_partial: bool) -> Result<IngestSummary> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut summary = IngestSummary::default();

    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let document: Document = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: not a run document", path.display(), n + 1))?;
        let kind = document.kind();
        pipeline
            .ingest(document)
            .with_context(|| format!("{}:{}: failed to ingest {kind}", path.display(), n + 1))?;
        summary.documents += 1;
        if kind == DocumentKind::Stop {
            summary.stopped = true;
            break;
        }
    }

    if !summary.stopped {
        match (freeze_partial, pipeline.run_uid()) {
            (true, Some(run_uid)) => {
                let run_uid = run_uid.to_string();
                pipeline.explicit_freeze(&run_uid)?;
                summary.partial_frozen = true;
            }
            (true, None) => warn!("Input has no start document; nothing to freeze"),
            (false, _) => {
                warn!("Input ended without a stop document; run left in the volatile store");
            }
        }
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    let volatile_path = args.volatile.unwrap_or(config.storage.volatile);
    let permanent_path = args.permanent.unwrap_or(config.storage.permanent);
    let log_level = args.log_level.unwrap_or(config.logging.level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let volatile: Arc<dyn DocumentStore> = Arc::new(
        DiskStore::open(&volatile_path)
            .with_context(|| format!("failed to open volatile store {}", volatile_path.display()))?,
    );
    let permanent: Arc<dyn DocumentStore> = Arc::new(
        DiskStore::open(&permanent_path).with_context(|| {
            format!("failed to open permanent store {}", permanent_path.display())
        })?,
    );
    let pipeline = RunPipeline::new(volatile, permanent, config.pipeline)?;

    match args.command {
        Commands::Ingest {
            file,
            freeze_partial,
        } => {
            let summary = ingest_file(&pipeline, &file, freeze_partial)?;
            info!("Ingested {} documents from {}", summary.documents, file.display());
            if summary.stopped || summary.partial_frozen {
                println!(
                    "Run {} frozen ({} documents)",
                    pipeline.run_uid().unwrap_or("?"),
                    summary.documents
                );
            } else {
                println!("Ingested {} documents; run not frozen", summary.documents);
            }
        }
        Commands::Freeze { run_id } => {
            pipeline.explicit_freeze(&run_id)?;
            println!("Run {run_id} frozen");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runvault_store::{Collection, Filter, MemoryStore};
    use std::io::Write;

    fn write_lines(dir: &Path, lines: &[&str]) -> PathBuf {
        let path = dir.join("run.jsonl");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    fn pipeline(
        volatile: Arc<dyn DocumentStore>,
        permanent: Arc<dyn DocumentStore>,
    ) -> RunPipeline {
        let config = PipelineConfig {
            poll_interval_ms: 10,
            ..Default::default()
        };
        RunPipeline::new(volatile, permanent, config).unwrap()
    }

    #[test]
    fn test_config_file() {
        let config: Config = toml::from_str(
            r#"
            [pipeline]
            page_size = 2000000

            [storage]
            volatile = "/tmp/v.redb"
        "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.page_size, 2_000_000);
        assert_eq!(config.pipeline.embedder_size, 1_000_000);
        assert_eq!(config.storage.volatile, PathBuf::from("/tmp/v.redb"));
        assert_eq!(config.storage.permanent, default_permanent());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_ingest_file_to_disk_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(
            dir.path(),
            &[
                r#"{"name": "start", "doc": {"uid": "run-1"}}"#,
                r#"{"name": "descriptor", "doc": {"uid": "d1", "run_start": "run-1"}}"#,
                "",
                r#"{"name": "event", "doc": {"descriptor": "d1", "uid": "e0", "seq_num": 1, "time": 0.1, "data": {"x": 1}, "timestamps": {"x": 0.1}, "filled": {}}}"#,
                r#"{"name": "event", "doc": {"descriptor": "d1", "uid": "e1", "seq_num": 2, "time": 0.2, "data": {"x": 2}, "timestamps": {"x": 0.2}, "filled": {}}}"#,
                r#"{"name": "stop", "doc": {"uid": "s1", "run_start": "run-1"}}"#,
            ],
        );
        let volatile = Arc::new(DiskStore::open(dir.path().join("volatile.redb")).unwrap());
        let permanent = Arc::new(DiskStore::open(dir.path().join("permanent.redb")).unwrap());
        let pipeline = pipeline(volatile.clone(), permanent.clone());

        let summary = ingest_file(&pipeline, &path, false).unwrap();
        assert_eq!(summary.documents, 5);
        assert!(summary.stopped);

        assert_eq!(volatile.count(Collection::Header, &Filter::new()).unwrap(), 0);
        let page = permanent
            .find_one(Collection::Event, &Filter::new().eq("descriptor", "d1"))
            .unwrap()
            .unwrap();
        assert_eq!(page["seq_num"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_partial_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(
            dir.path(),
            &[
                r#"{"name": "start", "doc": {"uid": "run-1"}}"#,
                r#"{"name": "resource", "doc": {"uid": "r1"}}"#,
                r#"{"name": "datum", "doc": {"resource": "r1", "datum_id": "r1/0", "datum_kwargs": {}}}"#,
            ],
        );
        let volatile = Arc::new(MemoryStore::new());
        let permanent = Arc::new(MemoryStore::new());
        let pipeline = pipeline(volatile.clone(), permanent.clone());

        let summary = ingest_file(&pipeline, &path, true).unwrap();
        assert!(summary.partial_frozen);
        assert!(volatile.is_empty());
        assert_eq!(permanent.count(Collection::Datum, &Filter::new()).unwrap(), 1);
    }

    #[test]
    fn test_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lines(dir.path(), &[r#"{"name": "bogus", "doc": {}}"#]);
        let pipeline = pipeline(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        let err = ingest_file(&pipeline, &path, false).unwrap_err();
        assert!(err.to_string().contains("run.jsonl:1"));
    }
}
