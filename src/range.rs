//! Series coverage ranges and their intersection.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::series::{DenseSeries, SparseSeries, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesKind {
    Dense,
    Sparse,
}

impl SeriesKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Sparse => "sparse",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("{} series has no timestamps; range is incomplete", .series.as_str())]
    IncompleteRange { series: SeriesKind },
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: Timestamp, end: Timestamp },
}

/// Closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    start: Timestamp,
    end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn duration(&self) -> ChronoDuration {
        self.end - self.start
    }

    /// Extends both ends by `tolerance`. Negative tolerances are treated as zero.
    pub fn widened(&self, tolerance: ChronoDuration) -> Self {
        let tolerance = tolerance.max(ChronoDuration::zero());
        Self {
            start: self.start.checked_sub_signed(tolerance).unwrap_or(self.start),
            end: self.end.checked_add_signed(tolerance).unwrap_or(self.end),
        }
    }
}

pub fn range_of_dense(series: &DenseSeries) -> Result<TimeRange, RangeError> {
    let timestamps = series.timestamps();
    match (timestamps.first(), timestamps.last()) {
        (Some(first), Some(last)) => TimeRange::new(*first, *last),
        _ => Err(RangeError::IncompleteRange {
            series: SeriesKind::Dense,
        }),
    }
}

pub fn range_of_sparse(series: &SparseSeries) -> Result<TimeRange, RangeError> {
    let mut timestamps = series.records().iter().map(|record| record.timestamp);
    let first = timestamps.next().ok_or(RangeError::IncompleteRange {
        series: SeriesKind::Sparse,
    })?;
    let (start, end) = timestamps.fold((first, first), |(lo, hi), ts| (lo.min(ts), hi.max(ts)));
    TimeRange::new(start, end)
}

/// Returns `None` when the ranges are disjoint.
pub fn intersect(a: &TimeRange, b: &TimeRange) -> Option<TimeRange> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    TimeRange::new(start, end).ok()
}
