use crate::ContractError;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeSet;

/// Number of values every CPU sample carries: sample count and nanoseconds.
pub const SAMPLE_VALUE_WIDTH: usize = 2;

pub type SampleValues = [i64; SAMPLE_VALUE_WIDTH];

/// Decoded profiling snapshot: samples → locations → lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub samples: Vec<SnapshotSample>,
    /// Capture time in nanoseconds since the epoch; zero when unknown.
    pub time_nanos: i64,
    pub duration_nanos: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSample {
    pub values: Vec<i64>,
    pub locations: Vec<SnapshotLocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotLocation {
    pub lines: Vec<SnapshotLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLine {
    pub function: String,
    pub file: String,
    pub line: i64,
}

impl Snapshot {
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        if self.time_nanos == 0 {
            return None;
        }
        Some(Utc.timestamp_nanos(self.time_nanos))
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Rows the snapshot stages: one per line, or one for a sample without lines.
    pub fn tuple_count(&self) -> usize {
        self.samples
            .iter()
            .map(|sample| {
                sample
                    .locations
                    .iter()
                    .map(|location| location.lines.len())
                    .sum::<usize>()
                    .max(1)
            })
            .sum()
    }

    pub fn distinct_call_sites(&self) -> BTreeSet<(&str, &str, i64)> {
        self.samples
            .iter()
            .flat_map(|sample| sample.locations.iter())
            .flat_map(|location| location.lines.iter())
            .map(|line| (line.function.as_str(), line.file.as_str(), line.line))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallSite<'a> {
    pub function: &'a str,
    pub file: &'a str,
    pub line: i64,
}

/// One staged row: a single source line of one location of one sample.
///
/// Ordinals are positions in the decoded snapshot; the same call site can
/// legitimately appear twice in one sample, so the ordinals are what keep
/// rows apart once they reach staging. A sample with no lines at all
/// (empty stack, unsymbolized addresses) stages one row with no call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTuple<'a> {
    pub sample_ordinal: usize,
    pub location_ordinal: usize,
    pub line_ordinal: usize,
    pub call_site: Option<CallSite<'a>>,
    pub values: SampleValues,
}

/// Lazy flattening of a snapshot into [`RawTuple`]s.
///
/// A sample with the wrong number of values yields one
/// [`ContractError::UnsupportedSampleShape`] and ends the stream.
pub struct SnapshotTuples<'a> {
    samples: &'a [SnapshotSample],
    sample: usize,
    location: usize,
    line: usize,
    current_values: Option<SampleValues>,
    emitted: bool,
    failed: bool,
}

pub fn normalize_snapshot(snapshot: &Snapshot) -> SnapshotTuples<'_> {
    SnapshotTuples {
        samples: &snapshot.samples,
        sample: 0,
        location: 0,
        line: 0,
        current_values: None,
        emitted: false,
        failed: false,
    }
}

impl<'a> Iterator for SnapshotTuples<'a> {
    type Item = Result<RawTuple<'a>, ContractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            let samples = self.samples;
            let sample = samples.get(self.sample)?;
            let values = match self.current_values {
                Some(values) => values,
                None => match sample_values(self.sample, sample) {
                    Ok(values) => {
                        self.current_values = Some(values);
                        values
                    }
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                },
            };

            if let Some(location) = sample.locations.get(self.location) {
                if let Some(line) = location.lines.get(self.line) {
                    let tuple = RawTuple {
                        sample_ordinal: self.sample,
                        location_ordinal: self.location,
                        line_ordinal: self.line,
                        call_site: Some(CallSite {
                            function: &line.function,
                            file: &line.file,
                            line: line.line,
                        }),
                        values,
                    };
                    self.line += 1;
                    self.emitted = true;
                    return Some(Ok(tuple));
                }
                self.location += 1;
                self.line = 0;
                continue;
            }

            let finished = self.sample;
            let emitted = self.emitted;
            self.sample += 1;
            self.location = 0;
            self.line = 0;
            self.current_values = None;
            self.emitted = false;
            if !emitted {
                return Some(Ok(RawTuple {
                    sample_ordinal: finished,
                    location_ordinal: 0,
                    line_ordinal: 0,
                    call_site: None,
                    values,
                }));
            }
        }
    }
}

fn sample_values(ordinal: usize, sample: &SnapshotSample) -> Result<SampleValues, ContractError> {
    SampleValues::try_from(sample.values.as_slice()).map_err(|_| {
        ContractError::UnsupportedSampleShape {
            sample_ordinal: ordinal,
            expected: SAMPLE_VALUE_WIDTH,
            found: sample.values.len(),
        }
    })
}
