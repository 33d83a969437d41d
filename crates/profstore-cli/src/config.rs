use anyhow::{bail, Context, Result};
use profstore_ingest::IngestionOptions;
use profstore_storage::{StoreOptions, DEFAULT_BUSY_TIMEOUT};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_ENV: &str = "PROFSTORE_DB";
pub const LOG_LEVEL_ENV: &str = "PROFSTORE_LOG_LEVEL";
const DEFAULT_DB_PATH: &str = "profiles.db";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub database: DatabaseSection,
    pub ingest: IngestSection,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct IngestSection {
    pub skip_duplicate_snapshots: bool,
}

pub fn load_config(path: &Path) -> Result<FileConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}

/// Flag values that override the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub db: Option<PathBuf>,
    pub busy_timeout_ms: Option<u64>,
    pub meta: Vec<String>,
    pub skip_duplicates: bool,
    pub log_level: Option<String>,
}

/// Effective settings after merging file, environment and flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub busy_timeout: Duration,
    pub skip_duplicate_snapshots: bool,
    pub metadata: BTreeMap<String, String>,
    pub log_level: String,
}

impl Settings {
    pub fn resolve(
        file: FileConfig,
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let db_path = overrides
            .db
            .clone()
            .or_else(|| env(DB_ENV).map(PathBuf::from))
            .or(file.database.path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let busy_timeout = overrides
            .busy_timeout_ms
            .or(file.database.busy_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BUSY_TIMEOUT);

        let mut metadata = file.metadata;
        for pair in &overrides.meta {
            let (key, value) = parse_meta_pair(pair)?;
            metadata.insert(key, value);
        }

        let log_level = overrides
            .log_level
            .clone()
            .or_else(|| env(LOG_LEVEL_ENV))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Ok(Self {
            db_path,
            busy_timeout,
            skip_duplicate_snapshots: overrides.skip_duplicates || file.ingest.skip_duplicate_snapshots,
            metadata,
            log_level,
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: self.busy_timeout,
        }
    }

    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            skip_duplicate_snapshots: self.skip_duplicate_snapshots,
        }
    }
}

pub fn parse_meta_pair(pair: &str) -> Result<(String, String)> {
    let Some((key, value)) = pair.split_once('=') else {
        bail!("metadata {pair:?} must be key=value");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("metadata {pair:?} has an empty key");
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn parses_full_config_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("profstore.toml");
        fs::write(
            &path,
            r#"
[database]
path = "/var/lib/profiles.db"
busy_timeout_ms = 250

[ingest]
skip_duplicate_snapshots = true

[metadata]
build_id = "456"
token = "fra.1"
dc = "fra"
"#,
        )
        .expect("write config");

        let config = load_config(&path).expect("load config");
        assert_eq!(
            config.database.path.as_deref(),
            Some(Path::new("/var/lib/profiles.db"))
        );
        assert_eq!(config.database.busy_timeout_ms, Some(250));
        assert!(config.ingest.skip_duplicate_snapshots);
        assert_eq!(config.metadata.len(), 3);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: FileConfig = toml::from_str("").expect("parse");
        let settings = Settings::resolve(config, &Overrides::default(), no_env).expect("resolve");
        assert_eq!(settings.db_path, PathBuf::from("profiles.db"));
        assert_eq!(settings.busy_timeout, DEFAULT_BUSY_TIMEOUT);
        assert!(!settings.skip_duplicate_snapshots);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn flags_override_file_and_environment() {
        let mut file = FileConfig::default();
        file.database.path = Some(PathBuf::from("file.db"));
        file.metadata.insert("token".to_string(), "file".to_string());
        file.metadata.insert("dc".to_string(), "fra".to_string());
        let env = |key: &str| match key {
            DB_ENV => Some("env.db".to_string()),
            LOG_LEVEL_ENV => Some("debug".to_string()),
            _ => None,
        };

        let from_env = Settings::resolve(file.clone(), &Overrides::default(), env).expect("resolve");
        assert_eq!(from_env.db_path, PathBuf::from("env.db"));
        assert_eq!(from_env.log_level, "debug");

        let overrides = Overrides {
            db: Some(PathBuf::from("flag.db")),
            busy_timeout_ms: Some(10),
            meta: vec!["token=flag".to_string(), "received_at=2024-01-01T00:00:00Z".to_string()],
            skip_duplicates: true,
            log_level: Some("warn".to_string()),
        };
        let settings = Settings::resolve(file, &overrides, env).expect("resolve");
        assert_eq!(settings.db_path, PathBuf::from("flag.db"));
        assert_eq!(settings.busy_timeout, Duration::from_millis(10));
        assert_eq!(settings.metadata.get("token").map(String::as_str), Some("flag"));
        assert_eq!(settings.metadata.get("dc").map(String::as_str), Some("fra"));
        assert_eq!(
            settings.metadata.get("received_at").map(String::as_str),
            Some("2024-01-01T00:00:00Z")
        );
        assert!(settings.ingestion_options().skip_duplicate_snapshots);
        assert_eq!(settings.log_level, "warn");
    }

    #[test]
    fn meta_pairs_need_a_key_and_separator() {
        assert_eq!(
            parse_meta_pair("dc=fra=1").expect("pair"),
            ("dc".to_string(), "fra=1".to_string())
        );
        assert!(parse_meta_pair("novalue").is_err());
        assert!(parse_meta_pair("=x").is_err());
    }
}
