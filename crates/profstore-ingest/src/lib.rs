use chrono::{DateTime, Utc};
use profstore_core::{
    normalize_snapshot, resolve_metadata, sha256_hex, ContractError, IngestionRecord,
    ServiceIdentity,
};
use profstore_pprof::{decode_snapshot, DecodeError};
use profstore_storage::{IngestionTx, ProfileStore, SnapshotEntry, StorageError};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Staged rows written between two stop-flag checks.
pub const STOP_CHECK_INTERVAL: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestionState {
    Parsing,
    ServiceRegistered,
    Staged,
    LocationsResolved,
    SamplesInserted,
    Committed,
    RolledBack,
}

impl IngestionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parsing => "parsing",
            Self::ServiceRegistered => "service_registered",
            Self::Staged => "staged",
            Self::LocationsResolved => "locations_resolved",
            Self::SamplesInserted => "samples_inserted",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for IngestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transactional step a storage error or cancellation originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestStage {
    ServiceRegistration,
    Staging,
    LocationResolution,
    Aggregation,
    Commit,
}

impl IngestStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceRegistration => "service registration",
            Self::Staging => "staging",
            Self::LocationResolution => "location resolution",
            Self::Aggregation => "sample aggregation",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestErrorKind {
    DecodeFailure,
    MalformedMetadata,
    UnsupportedSampleShape,
    ServiceRegistrationFailed,
    StagingWriteFailed,
    LocationResolutionFailed,
    AggregationFailed,
    CommitFailed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read profile {profile}")]
    Read {
        profile: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode profile {profile}")]
    Decode {
        profile: String,
        #[source]
        source: DecodeError,
    },
    #[error("invalid metadata for profile {profile}")]
    Metadata {
        profile: String,
        #[source]
        source: ContractError,
    },
    #[error("{stage} failed for profile {profile}")]
    Storage {
        stage: IngestStage,
        profile: String,
        #[source]
        source: StorageError,
    },
    #[error("ingestion of profile {profile} cancelled before {stage}")]
    Cancelled { stage: IngestStage, profile: String },
}

impl IngestError {
    pub fn kind(&self) -> IngestErrorKind {
        match self {
            Self::Read { .. } | Self::Decode { .. } => IngestErrorKind::DecodeFailure,
            Self::Metadata { .. } => IngestErrorKind::MalformedMetadata,
            Self::Cancelled { .. } => IngestErrorKind::Cancelled,
            Self::Storage {
                source: StorageError::Contract(ContractError::UnsupportedSampleShape { .. }),
                ..
            } => IngestErrorKind::UnsupportedSampleShape,
            Self::Storage { stage, .. } => match stage {
                IngestStage::ServiceRegistration => IngestErrorKind::ServiceRegistrationFailed,
                IngestStage::Staging => IngestErrorKind::StagingWriteFailed,
                IngestStage::LocationResolution => IngestErrorKind::LocationResolutionFailed,
                IngestStage::Aggregation => IngestErrorKind::AggregationFailed,
                IngestStage::Commit => IngestErrorKind::CommitFailed,
            },
        }
    }

    pub fn profile(&self) -> &str {
        match self {
            Self::Read { profile, .. }
            | Self::Decode { profile, .. }
            | Self::Metadata { profile, .. }
            | Self::Storage { profile, .. }
            | Self::Cancelled { profile, .. } => profile,
        }
    }

    fn storage(stage: IngestStage, profile: &str) -> impl FnOnce(StorageError) -> Self + '_ {
        move |source| Self::Storage {
            stage,
            profile: profile.to_string(),
            source,
        }
    }
}

/// Shared cancellation signal; cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionOptions {
    /// Skip snapshots whose content digest was already committed.
    pub skip_duplicate_snapshots: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionReport {
    pub profile: String,
    pub digest: String,
    pub identity: ServiceIdentity,
    pub snapshot_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub samples_in_snapshot: usize,
    pub call_sites_in_snapshot: usize,
    pub staged_tuples: usize,
    pub new_locations: usize,
    pub inserted_samples: usize,
    pub service_registered: bool,
    pub skipped_duplicate: bool,
    pub final_state: IngestionState,
}

impl IngestionReport {
    fn new(profile: &str, digest: String, record: &IngestionRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            profile: profile.to_string(),
            digest,
            identity: record.identity(),
            snapshot_id: None,
            created_at,
            samples_in_snapshot: record.snapshot.sample_count(),
            call_sites_in_snapshot: record.snapshot.distinct_call_sites().len(),
            staged_tuples: 0,
            new_locations: 0,
            inserted_samples: 0,
            service_registered: false,
            skipped_duplicate: false,
            final_state: IngestionState::Parsing,
        }
    }
}

/// Drives one snapshot at a time through decode, staging, location
/// resolution and aggregation inside a single store transaction.
#[derive(Debug, Clone, Default)]
pub struct ProfileIngestor {
    options: IngestionOptions,
    stop: StopFlag,
}

impl ProfileIngestor {
    pub fn new(options: IngestionOptions) -> Self {
        Self {
            options,
            stop: StopFlag::new(),
        }
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn ingest_file<I, K, V>(
        &self,
        store: &mut ProfileStore,
        metadata: I,
        path: impl AsRef<Path>,
    ) -> Result<IngestionReport, IngestError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let path = path.as_ref();
        let profile = path.display().to_string();
        let bytes = fs::read(path).map_err(|source| IngestError::Read {
            profile: profile.clone(),
            source,
        })?;
        self.ingest_bytes(store, metadata, &profile, &bytes)
    }

    /// Ingests an in-memory snapshot; `profile` names it in the snapshot log,
    /// reports and errors.
    pub fn ingest_bytes<I, K, V>(
        &self,
        store: &mut ProfileStore,
        metadata: I,
        profile: &str,
        bytes: &[u8],
    ) -> Result<IngestionReport, IngestError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let digest = sha256_hex(bytes);
        let snapshot = decode_snapshot(bytes).map_err(|source| IngestError::Decode {
            profile: profile.to_string(),
            source,
        })?;
        let record =
            resolve_metadata(metadata, snapshot).map_err(|source| IngestError::Metadata {
                profile: profile.to_string(),
                source,
            })?;

        let ingested_at = Utc::now();
        let mut report = IngestionReport::new(
            profile,
            digest,
            &record,
            record.created_at_or(ingested_at),
        );
        match self.run(store, &record, ingested_at, &mut report) {
            Ok(()) => Ok(report),
            Err(err) => {
                warn!(
                    event = "ingestion_rolled_back",
                    profile = %profile,
                    failed_after = %report.final_state,
                    kind = ?err.kind(),
                    error = %err
                );
                Err(err)
            }
        }
    }

    /// Ingests `paths` in order, one transaction each, stopping at the first
    /// error. A stop request between files ends the batch early.
    pub fn ingest_files<P: AsRef<Path>>(
        &self,
        store: &mut ProfileStore,
        metadata: &BTreeMap<String, String>,
        paths: &[P],
    ) -> Result<Vec<IngestionReport>, IngestError> {
        let mut reports = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            if self.stop.is_raised() {
                info!(
                    event = "batch_stopped",
                    ingested = reports.len(),
                    remaining = paths.len() - index
                );
                break;
            }
            reports.push(self.ingest_file(store, metadata, path)?);
        }
        Ok(reports)
    }

    fn run(
        &self,
        store: &mut ProfileStore,
        record: &IngestionRecord,
        ingested_at: DateTime<Utc>,
        report: &mut IngestionReport,
    ) -> Result<(), IngestError> {
        let profile = report.profile.clone();
        let identity = report.identity.clone();

        self.checkpoint(IngestStage::ServiceRegistration, &profile)?;
        let tx = store
            .begin_ingestion()
            .map_err(IngestError::storage(IngestStage::ServiceRegistration, &profile))?;

        report.service_registered =
            register(&tx, record, ingested_at).map_err(IngestError::storage(
                IngestStage::ServiceRegistration,
                &profile,
            ))?;

        if self.options.skip_duplicate_snapshots
            && tx
                .snapshot_digest_exists(&report.digest)
                .map_err(IngestError::storage(IngestStage::ServiceRegistration, &profile))?
        {
            tx.rollback()
                .map_err(IngestError::storage(IngestStage::ServiceRegistration, &profile))?;
            report.skipped_duplicate = true;
            report.service_registered = false;
            report.final_state = IngestionState::RolledBack;
            warn!(
                event = "duplicate_snapshot_skipped",
                profile = %profile,
                digest = %report.digest
            );
            return Ok(());
        }

        let snapshot_id = tx
            .record_snapshot(&SnapshotEntry {
                digest: report.digest.clone(),
                identity: identity.clone(),
                source: profile.clone(),
                received_at: record.received_at,
                created_at: report.created_at,
                ingested_at,
                sample_count: report.samples_in_snapshot,
            })
            .map_err(IngestError::storage(IngestStage::ServiceRegistration, &profile))?;
        report.snapshot_id = Some(snapshot_id);
        advance(report, IngestionState::ServiceRegistered);

        self.checkpoint(IngestStage::Staging, &profile)?;
        report.staged_tuples = self.stage(&tx, record, &profile)?;
        advance(report, IngestionState::Staged);

        self.checkpoint(IngestStage::LocationResolution, &profile)?;
        report.new_locations = tx
            .resolve_locations()
            .map_err(IngestError::storage(IngestStage::LocationResolution, &profile))?;
        advance(report, IngestionState::LocationsResolved);

        self.checkpoint(IngestStage::Aggregation, &profile)?;
        report.inserted_samples = tx
            .insert_samples(snapshot_id, &identity, report.created_at)
            .map_err(IngestError::storage(IngestStage::Aggregation, &profile))?;
        if report.inserted_samples != report.samples_in_snapshot {
            warn!(
                event = "fact_row_mismatch",
                profile = %profile,
                samples = report.samples_in_snapshot,
                fact_rows = report.inserted_samples,
                missing = report.samples_in_snapshot.saturating_sub(report.inserted_samples)
            );
        }
        advance(report, IngestionState::SamplesInserted);

        self.checkpoint(IngestStage::Commit, &profile)?;
        tx.commit()
            .map_err(IngestError::storage(IngestStage::Commit, &profile))?;
        advance(report, IngestionState::Committed);

        info!(
            event = "ingestion_committed",
            profile = %profile,
            build_id = %identity.build_id,
            token = %identity.token,
            snapshot_id,
            samples = report.samples_in_snapshot,
            call_sites = report.call_sites_in_snapshot,
            staged_tuples = report.staged_tuples,
            new_locations = report.new_locations,
            fact_rows = report.inserted_samples,
            service_registered = report.service_registered
        );
        Ok(())
    }

    fn stage(
        &self,
        tx: &IngestionTx<'_>,
        record: &IngestionRecord,
        profile: &str,
    ) -> Result<usize, IngestError> {
        debug!(
            event = "staging_started",
            profile = %profile,
            expected_tuples = record.snapshot.tuple_count()
        );
        let mut writer = tx
            .staging_writer()
            .map_err(IngestError::storage(IngestStage::Staging, profile))?;
        for tuple in normalize_snapshot(&record.snapshot) {
            let tuple = tuple.map_err(|err| IngestError::Storage {
                stage: IngestStage::Staging,
                profile: profile.to_string(),
                source: StorageError::Contract(err),
            })?;
            writer
                .write(&tuple)
                .map_err(IngestError::storage(IngestStage::Staging, profile))?;
            if writer.rows() % STOP_CHECK_INTERVAL == 0 {
                self.checkpoint(IngestStage::Staging, profile)?;
            }
        }
        Ok(writer.finish())
    }

    fn checkpoint(&self, stage: IngestStage, profile: &str) -> Result<(), IngestError> {
        if self.stop.is_raised() {
            return Err(IngestError::Cancelled {
                stage,
                profile: profile.to_string(),
            });
        }
        Ok(())
    }
}

fn register(
    tx: &IngestionTx<'_>,
    record: &IngestionRecord,
    registered_at: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let labels_json = record.labels_json()?;
    tx.register_service(&record.identity(), &record.service, &labels_json, registered_at)
}

fn advance(report: &mut IngestionReport, next: IngestionState) {
    debug!(
        event = "ingestion_state",
        profile = %report.profile,
        from = %report.final_state,
        to = %next
    );
    report.final_state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use profstore_pprof::encode_profile;
    use profstore_pprof::proto::{Function, Line, Location, Profile, Sample};

    fn single_frame_profile(values: Vec<i64>) -> Vec<u8> {
        let profile = Profile {
            sample: vec![Sample {
                location_id: vec![1],
                value: values,
                ..Default::default()
            }],
            location: vec![Location {
                id: 1,
                line: vec![Line {
                    function_id: 1,
                    line: 7,
                }],
                ..Default::default()
            }],
            function: vec![Function {
                id: 1,
                name: 1,
                filename: 2,
                ..Default::default()
            }],
            string_table: vec!["".to_string(), "main".to_string(), "main.go".to_string()],
            time_nanos: 1_700_000_000_000_000_000,
            ..Default::default()
        };
        encode_profile(&profile).expect("encode profile")
    }

    fn meta() -> Vec<(&'static str, &'static str)> {
        vec![("build_id", "1"), ("token", "t"), ("service", "svc")]
    }

    #[test]
    fn ingest_bytes_walks_every_state() {
        let mut store = ProfileStore::open_in_memory().expect("open store");
        let ingestor = ProfileIngestor::default();
        let report = ingestor
            .ingest_bytes(&mut store, meta(), "mem", &single_frame_profile(vec![1, 2]))
            .expect("ingest");

        assert_eq!(report.final_state, IngestionState::Committed);
        assert!(report.final_state.is_terminal());
        assert_eq!(report.samples_in_snapshot, 1);
        assert_eq!(report.staged_tuples, 1);
        assert_eq!(report.new_locations, 1);
        assert_eq!(report.inserted_samples, 1);
        assert!(report.service_registered);
        assert_eq!(report.digest.len(), 64);
    }

    #[test]
    fn wrong_value_width_is_reported_as_sample_shape() {
        let mut store = ProfileStore::open_in_memory().expect("open store");
        let err = ProfileIngestor::default()
            .ingest_bytes(&mut store, meta(), "mem", &single_frame_profile(vec![1]))
            .expect_err("shape must fail");

        assert_eq!(err.kind(), IngestErrorKind::UnsupportedSampleShape);
        assert_eq!(err.profile(), "mem");
        assert_eq!(store.service_count().expect("count"), 0);
    }

    #[test]
    fn garbage_bytes_are_decode_failures() {
        let mut store = ProfileStore::open_in_memory().expect("open store");
        let err = ProfileIngestor::default()
            .ingest_bytes(&mut store, meta(), "mem", b"\x1f\x8bnot gzip")
            .expect_err("decode must fail");
        assert_eq!(err.kind(), IngestErrorKind::DecodeFailure);
    }

    #[test]
    fn raised_stop_flag_cancels_before_the_transaction() {
        let mut store = ProfileStore::open_in_memory().expect("open store");
        let stop = StopFlag::new();
        let ingestor = ProfileIngestor::default().with_stop_flag(stop.clone());
        stop.raise();

        let err = ingestor
            .ingest_bytes(&mut store, meta(), "mem", &single_frame_profile(vec![1, 2]))
            .expect_err("cancelled");
        assert_eq!(err.kind(), IngestErrorKind::Cancelled);
        assert!(matches!(
            err,
            IngestError::Cancelled {
                stage: IngestStage::ServiceRegistration,
                ..
            }
        ));
        assert_eq!(store.snapshot_count().expect("count"), 0);
    }

    #[test]
    fn raised_stop_flag_interrupts_staging_at_the_next_check() {
        use profstore_core::{Snapshot, SnapshotLine, SnapshotLocation, SnapshotSample};

        let samples = (0..STOP_CHECK_INTERVAL + 10)
            .map(|index| SnapshotSample {
                values: vec![1, 10],
                locations: vec![SnapshotLocation {
                    lines: vec![SnapshotLine {
                        function: format!("f{index}"),
                        file: "a.go".to_string(),
                        line: 1,
                    }],
                }],
            })
            .collect();
        let snapshot = Snapshot {
            samples,
            ..Snapshot::default()
        };
        let record = resolve_metadata(meta(), snapshot).expect("record");
        let mut store = ProfileStore::open_in_memory().expect("open store");
        let ingestor = ProfileIngestor::default();

        {
            let tx = store.begin_ingestion().expect("begin");
            ingestor.stop_flag().raise();
            let err = ingestor
                .stage(&tx, &record, "mem")
                .expect_err("staging must stop");
            assert!(matches!(
                err,
                IngestError::Cancelled {
                    stage: IngestStage::Staging,
                    ..
                }
            ));
        }

        assert_eq!(store.staged_row_count().expect("staged"), 0);
        assert_eq!(store.location_count().expect("locations"), 0);
    }

    #[test]
    fn storage_errors_map_to_their_stage() {
        let err = IngestError::Storage {
            stage: IngestStage::LocationResolution,
            profile: "p".to_string(),
            source: StorageError::Serialization("boom".to_string()),
        };
        assert_eq!(err.kind(), IngestErrorKind::LocationResolutionFailed);
        assert_eq!(err.to_string(), "location resolution failed for profile p");
    }
}
