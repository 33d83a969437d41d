use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod metadata;
pub mod snapshot;

pub use metadata::{resolve_metadata, IngestionRecord, ServiceIdentity};
pub use snapshot::{
    normalize_snapshot, CallSite, RawTuple, SampleValues, Snapshot, SnapshotLine, SnapshotLocation,
    SnapshotSample, SnapshotTuples, SAMPLE_VALUE_WIDTH,
};

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("malformed metadata {key}={value:?}: {reason}")]
    MalformedMetadata {
        key: String,
        value: String,
        reason: String,
    },
    #[error(
        "unsupported sample shape at sample {sample_ordinal}: expected {expected} values, found {found}"
    )]
    UnsupportedSampleShape {
        sample_ordinal: usize,
        expected: usize,
        found: usize,
    },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Fixed-width RFC 3339 rendering used for every persisted timestamp.
///
/// Nanosecond precision with a `Z` suffix keeps lexical order equal to
/// chronological order, which the `(build_id, token, created_at)` index
/// relies on for range scans.
pub fn storage_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_storage_timestamp(value: &str) -> Result<DateTime<Utc>, ContractError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| ContractError::Serialization(format!("invalid timestamp {value:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn storage_timestamps_sort_lexically_in_time_order() {
        let earlier = Utc
            .with_ymd_and_hms(2026, 2, 23, 9, 59, 59)
            .single()
            .expect("valid timestamp");
        let later = Utc.timestamp_nanos(earlier.timestamp_nanos_opt().expect("in range") + 1);

        let a = storage_timestamp(earlier);
        let b = storage_timestamp(later);
        assert!(a < b);
        assert_eq!(a, "2026-02-23T09:59:59.000000000Z");
        assert_eq!(parse_storage_timestamp(&b).expect("parse"), later);
    }

    #[test]
    fn sha256_hex_is_lowercase_and_full_width() {
        let digest = sha256_hex(b"profile");
        assert_eq!(digest.len(), 64);
        assert!(digest
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch)));
    }
}
