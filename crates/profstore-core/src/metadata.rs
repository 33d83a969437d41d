use crate::{ContractError, Snapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const BUILD_ID_KEY: &str = "build_id";
pub const TOKEN_KEY: &str = "token";
pub const SERVICE_KEY: &str = "service";
pub const RECEIVED_AT_KEY: &str = "received_at";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceIdentity {
    pub build_id: String,
    pub token: String,
}

/// Caller metadata merged with a decoded snapshot, consumed by one ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionRecord {
    pub build_id: String,
    pub token: String,
    pub service: String,
    pub received_at: Option<DateTime<Utc>>,
    /// Snapshot capture time; `None` means the ingestion time is used.
    pub created_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub snapshot: Snapshot,
}

impl IngestionRecord {
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            build_id: self.build_id.clone(),
            token: self.token.clone(),
        }
    }

    pub fn created_at_or(&self, ingested_at: DateTime<Utc>) -> DateTime<Utc> {
        self.created_at.unwrap_or(ingested_at)
    }

    pub fn labels_json(&self) -> Result<String, ContractError> {
        serde_json::to_string(&self.labels)
            .map_err(|err| ContractError::Serialization(err.to_string()))
    }
}

/// Builds an [`IngestionRecord`] from caller metadata and a decoded snapshot.
///
/// `build_id`, `token` and `service` fill the identity (missing keys stay
/// empty), `received_at` must be RFC 3339, and every other key becomes a
/// service label.
pub fn resolve_metadata<I, K, V>(
    metadata: I,
    snapshot: Snapshot,
) -> Result<IngestionRecord, ContractError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut record = IngestionRecord {
        build_id: String::new(),
        token: String::new(),
        service: String::new(),
        received_at: None,
        created_at: snapshot.captured_at(),
        labels: BTreeMap::new(),
        snapshot,
    };

    for (key, value) in metadata {
        let (key, value) = (key.as_ref(), value.as_ref());
        match key {
            BUILD_ID_KEY => record.build_id = value.to_string(),
            TOKEN_KEY => record.token = value.to_string(),
            SERVICE_KEY => record.service = value.to_string(),
            RECEIVED_AT_KEY => {
                let received_at = DateTime::parse_from_rfc3339(value).map_err(|err| {
                    ContractError::MalformedMetadata {
                        key: key.to_string(),
                        value: value.to_string(),
                        reason: err.to_string(),
                    }
                })?;
                record.received_at = Some(received_at.with_timezone(&Utc));
            }
            _ => {
                record.labels.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok(record)
}
