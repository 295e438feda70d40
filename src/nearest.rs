//! Nearest dense sample lookup with a tolerance window.

use chrono::Duration as ChronoDuration;

use crate::series::{DenseSeries, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearestMatch {
    pub index: usize,
    pub timestamp: Timestamp,
    pub delta: ChronoDuration,
}

/// Finds the dense sample closest to `query`.
///
/// Candidates are the first sample at or after the leftmost insertion point
/// and the sample immediately before it. Equidistant candidates resolve to the
/// earlier index; a run of identical timestamps resolves to its first entry.
/// A delta of `tolerance` or more is no match.
pub fn nearest_within(
    series: &DenseSeries,
    query: Timestamp,
    tolerance: ChronoDuration,
) -> Option<NearestMatch> {
    let timestamps = series.timestamps();
    if timestamps.is_empty() {
        return None;
    }

    let insertion = timestamps.partition_point(|ts| *ts < query);
    let after = timestamps
        .get(insertion)
        .map(|ts| (insertion, (*ts - query).abs()));
    let before = insertion.checked_sub(1).map(|idx| {
        // first sample of the run sharing this timestamp
        let run_start = timestamps.partition_point(|ts| *ts < timestamps[idx]);
        (run_start, (query - timestamps[idx]).abs())
    });

    let (index, delta) = match (before, after) {
        (Some(b), Some(a)) => {
            if a.1 < b.1 {
                a
            } else {
                b
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    if delta >= tolerance {
        return None;
    }

    Some(NearestMatch {
        index,
        timestamp: timestamps[index],
        delta,
    })
}
