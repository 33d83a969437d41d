mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{load_config, FileConfig, Overrides, Settings};
use profstore_ingest::{IngestionReport, ProfileIngestor};
use profstore_storage::ProfileStore;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "profstore")]
#[command(about = "Load pprof CPU snapshots into a profile store", long_about = None)]
struct Cli {
    /// TOML config with [database], [ingest] and [metadata] sections
    #[arg(long)]
    config: Option<PathBuf>,
    /// Store path; falls back to PROFSTORE_DB, then the config file
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    busy_timeout_ms: Option<u64>,
    /// Snapshot metadata as key=value, repeatable
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    meta: Vec<String>,
    /// Skip snapshots whose content was already ingested
    #[arg(long, default_value_t = false)]
    skip_duplicates: bool,
    #[arg(long)]
    log_level: Option<String>,
    /// pprof snapshot files, ingested in order
    profiles: Vec<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            db: self.db.clone(),
            busy_timeout_ms: self.busy_timeout_ms,
            meta: self.meta.clone(),
            skip_duplicates: self.skip_duplicates,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => load_config(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(file, &cli.overrides(), |key| std::env::var(key).ok())?;
    init_logging(&settings.log_level);

    if cli.profiles.is_empty() {
        bail!("no profiles passed");
    }

    let ingestor = ProfileIngestor::new(settings.ingestion_options());
    let stop = ingestor.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(event = "stop_requested");
            stop.raise();
        }
    });

    let profiles = cli.profiles;
    let worker = tokio::task::spawn_blocking(move || ingest_all(&ingestor, &settings, &profiles));
    let reports = worker.await.context("ingestion worker failed")??;

    let fact_rows: usize = reports.iter().map(|report| report.inserted_samples).sum();
    let skipped = reports.iter().filter(|report| report.skipped_duplicate).count();
    info!(
        event = "batch_complete",
        profiles = reports.len(),
        fact_rows,
        skipped_duplicates = skipped
    );
    Ok(())
}

fn ingest_all(
    ingestor: &ProfileIngestor,
    settings: &Settings,
    profiles: &[PathBuf],
) -> Result<Vec<IngestionReport>> {
    let mut store = ProfileStore::open_with_options(&settings.db_path, &settings.store_options())
        .with_context(|| format!("failed to open store {}", settings.db_path.display()))?;
    info!(
        event = "store_opened",
        path = %settings.db_path.display(),
        profiles = profiles.len()
    );
    Ok(ingestor.ingest_files(&mut store, &settings.metadata, profiles)?)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_meta_and_positional_profiles() {
        let cli = Cli::try_parse_from([
            "profstore",
            "--db",
            "p.db",
            "--meta",
            "build_id=456",
            "--meta",
            "token=fra.1",
            "--skip-duplicates",
            "a.pb.gz",
            "b.pb.gz",
        ])
        .expect("parse args");

        assert_eq!(cli.db, Some(PathBuf::from("p.db")));
        assert_eq!(cli.meta, vec!["build_id=456", "token=fra.1"]);
        assert!(cli.skip_duplicates);
        assert_eq!(
            cli.profiles,
            vec![PathBuf::from("a.pb.gz"), PathBuf::from("b.pb.gz")]
        );
        assert!(cli.overrides().skip_duplicates);
    }

    #[test]
    fn ingest_all_reports_missing_files_as_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::resolve(
            FileConfig::default(),
            &Overrides {
                db: Some(dir.path().join("p.db")),
                ..Overrides::default()
            },
            |_| None,
        )
        .expect("settings");

        let err = ingest_all(
            &ProfileIngestor::default(),
            &settings,
            &[dir.path().join("missing.pb.gz")],
        )
        .expect_err("missing profile");
        assert!(err.to_string().contains("missing.pb.gz"));
    }
}
