use crate::StorageError;
use chrono::{DateTime, Utc};
use profstore_core::{storage_timestamp, RawTuple, ServiceIdentity};
use rusqlite::{params, CachedStatement, OptionalExtension, Transaction};

const STAGE_TUPLE_SQL: &str = "
    INSERT INTO temp.staged_tuples (
        sample_ordinal,
        location_ordinal,
        line_ordinal,
        function,
        file,
        line,
        value_0,
        value_1
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
";

// The WHERE clause also keeps SQLite from reading ON CONFLICT as a join constraint.
const RESOLVE_LOCATIONS_SQL: &str = "
    INSERT INTO locations (function, file, line)
    SELECT function, file, line
    FROM temp.staged_tuples
    WHERE function IS NOT NULL
    GROUP BY function, file, line
    ORDER BY MIN(rowid)
    ON CONFLICT(function, file, line) DO NOTHING
";

const INSERT_SAMPLES_SQL: &str = "
    INSERT INTO samples (
        snapshot_id,
        build_id,
        token,
        location_ids_json,
        created_at,
        value_0,
        value_1
    )
    SELECT
        ?1,
        ?2,
        ?3,
        CASE
            WHEN COUNT(l.id) = 0 THEN '[]'
            ELSE json_group_array(l.id ORDER BY s.location_ordinal, s.line_ordinal)
        END,
        ?4,
        s.value_0,
        s.value_1
    FROM temp.staged_tuples AS s
    LEFT JOIN locations AS l
        ON l.function = s.function AND l.file = s.file AND l.line = s.line
    GROUP BY s.sample_ordinal, s.value_0, s.value_1
    ORDER BY s.sample_ordinal
";

/// Row written to the snapshot log before the fact rows that reference it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub digest: String,
    pub identity: ServiceIdentity,
    pub source: String,
    pub received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub sample_count: usize,
}

/// Write transaction for one snapshot.
///
/// The staging table is emptied when the transaction opens and again right
/// before commit; dropping the value without committing rolls back every
/// row written through it, staged rows included.
pub struct IngestionTx<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> IngestionTx<'conn> {
    pub(crate) fn new(tx: Transaction<'conn>) -> Result<Self, StorageError> {
        tx.execute("DELETE FROM temp.staged_tuples", [])?;
        Ok(Self { tx })
    }

    /// Inserts the service unless `(build_id, token)` already exists.
    ///
    /// Returns `true` when this call created the row.
    pub fn register_service(
        &self,
        identity: &ServiceIdentity,
        name: &str,
        labels_json: &str,
        registered_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.tx.execute(
            "
            INSERT INTO services (build_id, token, name, labels_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(build_id, token) DO NOTHING
            ",
            params![
                identity.build_id,
                identity.token,
                name,
                labels_json,
                storage_timestamp(registered_at),
            ],
        )?;
        Ok(changes > 0)
    }

    pub fn snapshot_digest_exists(&self, digest: &str) -> Result<bool, StorageError> {
        let found = self
            .tx
            .query_row(
                "SELECT 1 FROM snapshots WHERE digest = ?1 LIMIT 1",
                [digest],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn record_snapshot(&self, entry: &SnapshotEntry) -> Result<i64, StorageError> {
        self.tx.execute(
            "
            INSERT INTO snapshots (
                digest,
                build_id,
                token,
                source,
                received_at,
                created_at,
                ingested_at,
                sample_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                entry.digest,
                entry.identity.build_id,
                entry.identity.token,
                entry.source,
                entry.received_at.map(storage_timestamp),
                storage_timestamp(entry.created_at),
                storage_timestamp(entry.ingested_at),
                entry.sample_count as i64,
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn staging_writer(&self) -> Result<StagingWriter<'_>, StorageError> {
        let statement = self.tx.prepare_cached(STAGE_TUPLE_SQL)?;
        Ok(StagingWriter { statement, rows: 0 })
    }

    /// Adds staged call sites missing from the dictionary; returns how many were new.
    pub fn resolve_locations(&self) -> Result<usize, StorageError> {
        Ok(self.tx.execute(RESOLVE_LOCATIONS_SQL, [])?)
    }

    /// Collapses staged tuples into one fact row per sample; returns rows inserted.
    ///
    /// Rows staged without a call site yield an empty location list.
    pub fn insert_samples(
        &self,
        snapshot_id: i64,
        identity: &ServiceIdentity,
        created_at: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        Ok(self.tx.execute(
            INSERT_SAMPLES_SQL,
            params![
                snapshot_id,
                identity.build_id,
                identity.token,
                storage_timestamp(created_at),
            ],
        )?)
    }

    pub fn commit(self) -> Result<(), StorageError> {
        self.tx.execute("DELETE FROM temp.staged_tuples", [])?;
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback()?;
        Ok(())
    }
}

/// Bulk loader reusing one prepared insert for every staged row.
pub struct StagingWriter<'tx> {
    statement: CachedStatement<'tx>,
    rows: usize,
}

impl StagingWriter<'_> {
    pub fn write(&mut self, tuple: &RawTuple<'_>) -> Result<(), StorageError> {
        let site = tuple.call_site;
        self.statement.execute(params![
            tuple.sample_ordinal as i64,
            tuple.location_ordinal as i64,
            tuple.line_ordinal as i64,
            site.map(|site| site.function),
            site.map(|site| site.file),
            site.map(|site| site.line),
            tuple.values[0],
            tuple.values[1],
        ])?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(self) -> usize {
        self.rows
    }
}
