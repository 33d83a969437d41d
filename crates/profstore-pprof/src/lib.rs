use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use profstore_core::{Snapshot, SnapshotLine, SnapshotLocation, SnapshotSample};
use prost::Message;
use std::collections::HashMap;
use std::io::{Read, Write};
use thiserror::Error;

pub mod proto;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("{kind} id {id} referenced but not defined")]
    DanglingReference { kind: &'static str, id: u64 },
    #[error("string table index {index} out of range (table has {len} entries)")]
    StringIndex { index: i64, len: usize },
}

/// Decodes a pprof snapshot, gzip-compressed or plain, into the sample graph.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, DecodeError> {
    let profile = if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        proto::Profile::decode(raw.as_slice())?
    } else {
        proto::Profile::decode(bytes)?
    };
    resolve_profile(&profile)
}

/// Serializes and gzip-compresses a profile the way profilers write them.
pub fn encode_profile(profile: &proto::Profile) -> Result<Vec<u8>, DecodeError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&profile.encode_to_vec())?;
    Ok(encoder.finish()?)
}

fn resolve_profile(profile: &proto::Profile) -> Result<Snapshot, DecodeError> {
    let strings = &profile.string_table;
    let functions = profile
        .function
        .iter()
        .map(|function| (function.id, function))
        .collect::<HashMap<u64, &proto::Function>>();

    let mut locations = HashMap::with_capacity(profile.location.len());
    for location in &profile.location {
        let mut lines = Vec::with_capacity(location.line.len());
        for line in &location.line {
            let function =
                functions
                    .get(&line.function_id)
                    .ok_or(DecodeError::DanglingReference {
                        kind: "function",
                        id: line.function_id,
                    })?;
            lines.push(SnapshotLine {
                function: string_at(strings, function.name)?.to_string(),
                file: string_at(strings, function.filename)?.to_string(),
                line: line.line,
            });
        }
        locations.insert(location.id, SnapshotLocation { lines });
    }

    let mut samples = Vec::with_capacity(profile.sample.len());
    for sample in &profile.sample {
        let mut sample_locations = Vec::with_capacity(sample.location_id.len());
        for id in &sample.location_id {
            let location = locations.get(id).ok_or(DecodeError::DanglingReference {
                kind: "location",
                id: *id,
            })?;
            sample_locations.push(location.clone());
        }
        samples.push(SnapshotSample {
            values: sample.value.clone(),
            locations: sample_locations,
        });
    }

    Ok(Snapshot {
        samples,
        time_nanos: profile.time_nanos,
        duration_nanos: profile.duration_nanos,
    })
}

fn string_at(strings: &[String], index: i64) -> Result<&str, DecodeError> {
    usize::try_from(index)
        .ok()
        .and_then(|position| strings.get(position))
        .map(String::as_str)
        .ok_or(DecodeError::StringIndex {
            index,
            len: strings.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> proto::Profile {
        let strings = ["", "samples", "count", "cpu", "nanoseconds", "main", "main.go", "work", "work.go"];
        proto::Profile {
            sample_type: vec![
                proto::ValueType { r#type: 1, unit: 2 },
                proto::ValueType { r#type: 3, unit: 4 },
            ],
            sample: vec![
                proto::Sample {
                    location_id: vec![2, 1],
                    value: vec![3, 60],
                    label: Vec::new(),
                },
                proto::Sample {
                    location_id: vec![1],
                    value: vec![5, 100],
                    label: Vec::new(),
                },
            ],
            location: vec![
                proto::Location {
                    id: 1,
                    line: vec![proto::Line {
                        function_id: 10,
                        line: 12,
                    }],
                    ..Default::default()
                },
                proto::Location {
                    id: 2,
                    line: vec![
                        proto::Line {
                            function_id: 11,
                            line: 40,
                        },
                        proto::Line {
                            function_id: 10,
                            line: 13,
                        },
                    ],
                    ..Default::default()
                },
            ],
            function: vec![
                proto::Function {
                    id: 10,
                    name: 5,
                    filename: 6,
                    ..Default::default()
                },
                proto::Function {
                    id: 11,
                    name: 7,
                    filename: 8,
                    ..Default::default()
                },
            ],
            string_table: strings.iter().map(|value| value.to_string()).collect(),
            time_nanos: 1_771_840_800_000_000_000,
            duration_nanos: 10_000_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn gzip_and_plain_encodings_decode_to_the_same_graph() {
        let profile = fixture();
        let gz = encode_profile(&profile).expect("encode");
        assert!(gz.starts_with(&GZIP_MAGIC));

        let from_gzip = decode_snapshot(&gz).expect("decode gzip");
        let from_plain = decode_snapshot(&profile.encode_to_vec()).expect("decode plain");
        assert_eq!(from_gzip, from_plain);

        assert_eq!(from_gzip.sample_count(), 2);
        assert_eq!(from_gzip.time_nanos, 1_771_840_800_000_000_000);

        let first = &from_gzip.samples[0];
        assert_eq!(first.values, vec![3, 60]);
        assert_eq!(first.locations.len(), 2);
        let inlined = first.locations[0]
            .lines
            .iter()
            .map(|line| (line.function.as_str(), line.file.as_str(), line.line))
            .collect::<Vec<_>>();
        assert_eq!(inlined, vec![("work", "work.go", 40), ("main", "main.go", 13)]);
    }

    #[test]
    fn dangling_references_are_rejected() {
        let mut profile = fixture();
        profile.sample[0].location_id.push(99);
        match decode_snapshot(&profile.encode_to_vec()) {
            Err(DecodeError::DanglingReference { kind, id }) => {
                assert_eq!(kind, "location");
                assert_eq!(id, 99);
            }
            other => panic!("expected dangling location, got {other:?}"),
        }

        let mut profile = fixture();
        profile.function[0].name = 42;
        assert!(matches!(
            decode_snapshot(&profile.encode_to_vec()),
            Err(DecodeError::StringIndex { index: 42, .. })
        ));
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        assert!(decode_snapshot(&[0x1f, 0x8b, 0x00, 0x01]).is_err());
        assert!(decode_snapshot(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
