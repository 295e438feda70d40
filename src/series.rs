//! Dense (instrument) and sparse (ground-truth) series containers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub type Timestamp = DateTime<Utc>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseSample {
    pub timestamp: Timestamp,
    pub channels: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseRecord {
    pub timestamp: Timestamp,
    pub value: f64,
    pub tag: BTreeMap<String, String>,
}

impl SparseRecord {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self {
            timestamp,
            value,
            tag: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tag.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeriesError {
    #[error("dense row {row} has {found} channels, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error(
        "dense series is unsorted and has {timestamps} timestamps for {rows} channel rows; refusing to reorder"
    )]
    DataShape { timestamps: usize, rows: usize },
}

/// Dense series, sorted ascending by timestamp.
///
/// Timestamps and channel rows are stored separately because source files do
/// not always agree on their lengths; lookups go through [`DenseSeries::channels`]
/// which bounds-checks instead of trusting the two to match.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseSeries {
    channel_count: usize,
    timestamps: Vec<Timestamp>,
    rows: Vec<Vec<f64>>,
}

impl DenseSeries {
    pub fn new(
        channel_count: usize,
        timestamps: Vec<Timestamp>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, SeriesError> {
        for (row, channels) in rows.iter().enumerate() {
            if channels.len() != channel_count {
                return Err(SeriesError::RaggedRow {
                    row,
                    found: channels.len(),
                    expected: channel_count,
                });
            }
        }

        if timestamps.len() != rows.len() {
            warn!(
                component = "series",
                event = "series.dense.shape_mismatch",
                timestamps = timestamps.len(),
                rows = rows.len()
            );
        }

        let sorted = timestamps.windows(2).all(|pair| pair[0] <= pair[1]);
        if sorted {
            return Ok(Self {
                channel_count,
                timestamps,
                rows,
            });
        }

        if timestamps.len() != rows.len() {
            return Err(SeriesError::DataShape {
                timestamps: timestamps.len(),
                rows: rows.len(),
            });
        }

        warn!(
            component = "series",
            event = "series.dense.sorted",
            samples = timestamps.len()
        );
        let mut paired: Vec<(Timestamp, Vec<f64>)> = timestamps.into_iter().zip(rows).collect();
        paired.sort_by_key(|(ts, _)| *ts);
        let (timestamps, rows) = paired.into_iter().unzip();

        Ok(Self {
            channel_count,
            timestamps,
            rows,
        })
    }

    pub fn from_samples(
        channel_count: usize,
        samples: Vec<DenseSample>,
    ) -> Result<Self, SeriesError> {
        let (timestamps, rows) = samples
            .into_iter()
            .map(|sample| (sample.timestamp, sample.channels))
            .unzip();
        Self::new(channel_count, timestamps, rows)
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Number of samples addressable by timestamp.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn timestamp(&self, index: usize) -> Option<Timestamp> {
        self.timestamps.get(index).copied()
    }

    pub fn channels(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn sample(&self, index: usize) -> Option<DenseSample> {
        Some(DenseSample {
            timestamp: self.timestamp(index)?,
            channels: self.channels(index)?.to_vec(),
        })
    }
}

/// Sparse series in source order. No ordering is assumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseSeries {
    records: Vec<SparseRecord>,
}

impl SparseSeries {
    pub fn new(records: Vec<SparseRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[SparseRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
