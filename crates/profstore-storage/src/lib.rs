use chrono::{DateTime, Utc};
use profstore_core::{
    parse_storage_timestamp, ContractError, SampleValues, ServiceIdentity,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod ingestion;

pub use ingestion::{IngestionTx, SnapshotEntry, StagingWriter};

pub const PROFILE_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const STAGING_TABLE_SQL: &str = "
    CREATE TEMP TABLE IF NOT EXISTS staged_tuples (
        sample_ordinal INTEGER NOT NULL,
        location_ordinal INTEGER NOT NULL,
        line_ordinal INTEGER NOT NULL,
        function TEXT,
        file TEXT,
        line INTEGER,
        value_0 INTEGER NOT NULL,
        value_1 INTEGER NOT NULL
    );
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredService {
    pub build_id: String,
    pub token: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLocation {
    pub id: i64,
    pub function: String,
    pub file: String,
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSample {
    pub id: i64,
    pub snapshot_id: i64,
    pub build_id: String,
    pub token: String,
    pub location_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub values: SampleValues,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub id: i64,
    pub digest: String,
    pub build_id: String,
    pub token: String,
    pub source: String,
    pub received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub sample_count: i64,
}

pub struct ProfileStore {
    conn: Connection,
}

impl ProfileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_options(path, &StoreOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: &StoreOptions,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.migrate()?;
        store.conn.execute_batch(STAGING_TABLE_SQL)?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > PROFILE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: PROFILE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_profile_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Opens the single write transaction one snapshot is ingested in.
    ///
    /// The transaction is `IMMEDIATE`, so concurrent ingesters queue on the
    /// database write lock (bounded by the busy timeout) instead of failing
    /// late with a lock upgrade error.
    pub fn begin_ingestion(&mut self) -> Result<IngestionTx<'_>, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        IngestionTx::new(tx)
    }

    pub fn service(
        &self,
        identity: &ServiceIdentity,
    ) -> Result<Option<StoredService>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT build_id, token, name, labels_json, created_at
                FROM services
                WHERE build_id = ?1 AND token = ?2
                ",
                params![identity.build_id, identity.token],
                |row| {
                    let labels_json: String = row.get(3)?;
                    let labels: BTreeMap<String, String> = serde_json::from_str(&labels_json)
                        .map_err(|err| conversion_failure(3, err))?;
                    let created_at = parse_timestamp_column(row, 4)?;

                    Ok(StoredService {
                        build_id: row.get(0)?,
                        token: row.get(1)?,
                        name: row.get(2)?,
                        labels,
                        created_at,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    pub fn location(&self, id: i64) -> Result<Option<StoredLocation>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, function, file, line FROM locations WHERE id = ?1",
                [id],
                |row| {
                    Ok(StoredLocation {
                        id: row.get(0)?,
                        function: row.get(1)?,
                        file: row.get(2)?,
                        line: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Maps a fact row's location ids back to their call sites, in order.
    pub fn call_sites(&self, location_ids: &[i64]) -> Result<Vec<StoredLocation>, StorageError> {
        let mut call_sites = Vec::with_capacity(location_ids.len());
        for id in location_ids {
            let location = self.location(*id)?.ok_or_else(|| {
                StorageError::Serialization(format!("location {id} referenced but missing"))
            })?;
            call_sites.push(location);
        }
        Ok(call_sites)
    }

    pub fn snapshot(&self, id: i64) -> Result<Option<StoredSnapshot>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT id, digest, build_id, token, source, received_at, created_at, ingested_at, sample_count
                FROM snapshots
                WHERE id = ?1
                ",
                [id],
                |row| {
                    let received_at = row
                        .get::<_, Option<String>>(5)?
                        .map(|value| parse_storage_timestamp(&value))
                        .transpose()
                        .map_err(|err| conversion_failure(5, err))?;

                    Ok(StoredSnapshot {
                        id: row.get(0)?,
                        digest: row.get(1)?,
                        build_id: row.get(2)?,
                        token: row.get(3)?,
                        source: row.get(4)?,
                        received_at,
                        created_at: parse_timestamp_column(row, 6)?,
                        ingested_at: parse_timestamp_column(row, 7)?,
                        sample_count: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn samples_for_snapshot(&self, snapshot_id: i64) -> Result<Vec<StoredSample>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT id, snapshot_id, build_id, token, location_ids_json, created_at, value_0, value_1
            FROM samples
            WHERE snapshot_id = ?1
            ORDER BY id ASC
            ",
        )?;

        let rows = statement.query_map([snapshot_id], |row| {
            let location_ids_json: String = row.get(4)?;
            let location_ids: Vec<i64> = serde_json::from_str(&location_ids_json)
                .map_err(|err| conversion_failure(4, err))?;

            Ok(StoredSample {
                id: row.get(0)?,
                snapshot_id: row.get(1)?,
                build_id: row.get(2)?,
                token: row.get(3)?,
                location_ids,
                created_at: parse_timestamp_column(row, 5)?,
                values: [row.get(6)?, row.get(7)?],
            })
        })?;

        let mut samples = Vec::new();
        for row in rows {
            samples.push(row?);
        }
        Ok(samples)
    }

    pub fn service_count(&self) -> Result<i64, StorageError> {
        self.count("SELECT COUNT(*) FROM services")
    }

    pub fn location_count(&self) -> Result<i64, StorageError> {
        self.count("SELECT COUNT(*) FROM locations")
    }

    pub fn sample_count(&self) -> Result<i64, StorageError> {
        self.count("SELECT COUNT(*) FROM samples")
    }

    pub fn snapshot_count(&self) -> Result<i64, StorageError> {
        self.count("SELECT COUNT(*) FROM snapshots")
    }

    /// Rows currently sitting in this connection's staging table.
    pub fn staged_row_count(&self) -> Result<i64, StorageError> {
        self.count("SELECT COUNT(*) FROM temp.staged_tuples")
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn count(&self, sql: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }
}

fn parse_timestamp_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(index)?;
    parse_storage_timestamp(&value).map_err(|err| conversion_failure(index, err))
}

fn conversion_failure<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}
