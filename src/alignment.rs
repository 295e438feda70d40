//! Joins sparse ground-truth records onto the dense instrument series.

use std::collections::BTreeMap;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{AlignmentCache, CacheKey};
use crate::nearest::nearest_within;
use crate::range::{intersect, range_of_dense, range_of_sparse, RangeError, TimeRange};
use crate::series::{DenseSeries, SparseRecord, SparseSeries, Timestamp};

pub const DEFAULT_MATCH_TOLERANCE_MS: i64 = 1_000;

const PROGRESS_LOG_EVERY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentConfig {
    /// Maximum distance between a sparse record and its dense sample.
    pub match_tolerance: ChronoDuration,
    /// Slack added to both ends of the overlap window before filtering records.
    pub range_tolerance: ChronoDuration,
    /// Skip the cache lookup. The fresh result is still written back.
    pub cache_bypass: bool,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            match_tolerance: ChronoDuration::milliseconds(DEFAULT_MATCH_TOLERANCE_MS),
            range_tolerance: ChronoDuration::zero(),
            cache_bypass: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedPair {
    pub timestamp: Timestamp,
    pub channels: Vec<f64>,
    pub ground_truth: f64,
    pub tag: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedDataset {
    pub channel_count: usize,
    pub pairs: Vec<AlignedPair>,
}

impl AlignedDataset {
    pub fn empty(channel_count: usize) -> Self {
        Self {
            channel_count,
            pairs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn ground_truth(&self) -> Vec<f64> {
        self.pairs.iter().map(|pair| pair.ground_truth).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    OutsideOverlap,
    NoDenseMatch,
    /// The matched dense index has a timestamp but no channel row.
    MissingChannels { index: usize },
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutsideOverlap => "outside_overlap",
            Self::NoDenseMatch => "no_dense_match",
            Self::MissingChannels { .. } => "missing_channels",
        }
    }
}

/// Receives per-record outcomes while a join runs.
pub trait AlignmentObserver {
    fn on_skip(&mut self, _position: usize, _record: &SparseRecord, _reason: SkipReason) {}

    fn on_progress(&mut self, _done: usize, _total: usize) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl AlignmentObserver for NoopObserver {}

/// Forwards observer callbacks to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl AlignmentObserver for TracingObserver {
    fn on_skip(&mut self, position: usize, record: &SparseRecord, reason: SkipReason) {
        match reason {
            SkipReason::OutsideOverlap => debug!(
                component = "alignment",
                event = "alignment.record.skipped",
                position,
                timestamp = %record.timestamp,
                reason = reason.as_str()
            ),
            SkipReason::NoDenseMatch => warn!(
                component = "alignment",
                event = "alignment.record.skipped",
                position,
                timestamp = %record.timestamp,
                reason = reason.as_str()
            ),
            SkipReason::MissingChannels { index } => warn!(
                component = "alignment",
                event = "alignment.record.skipped",
                position,
                timestamp = %record.timestamp,
                dense_index = index,
                reason = reason.as_str()
            ),
        }
    }

    fn on_progress(&mut self, done: usize, total: usize) {
        if done % PROGRESS_LOG_EVERY == 0 || done == total {
            debug!(
                component = "alignment",
                event = "alignment.progress",
                done,
                total
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Disabled,
    Hit,
    Miss,
    Bypassed,
    Corrupt,
}

/// Counters for one join. On a cache hit only `sparse_records` and
/// `aligned` are populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub sparse_records: u64,
    pub in_overlap: u64,
    pub aligned: u64,
    pub skipped_outside: u64,
    pub skipped_no_match: u64,
    pub skipped_missing_channels: u64,
    /// Window records were admitted from: the dense range widened by the
    /// range tolerance, intersected with the sparse range.
    pub overlap: Option<TimeRange>,
    pub cache: CacheStatus,
}

impl AlignmentReport {
    fn new(sparse_records: usize, cache: CacheStatus) -> Self {
        Self {
            sparse_records: sparse_records as u64,
            in_overlap: 0,
            aligned: 0,
            skipped_outside: 0,
            skipped_no_match: 0,
            skipped_missing_channels: 0,
            overlap: None,
            cache,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.skipped_outside + self.skipped_no_match + self.skipped_missing_channels
    }
}

#[derive(Debug, Error)]
pub enum AlignError {
    #[error(transparent)]
    Range(#[from] RangeError),
}

/// Aligns without consulting any cache.
///
/// Either series being empty is an [`RangeError::IncompleteRange`]. Ranges
/// that exist but do not intersect produce an empty dataset.
pub fn align(
    dense: &DenseSeries,
    sparse: &SparseSeries,
    cfg: &AlignmentConfig,
    observer: &mut dyn AlignmentObserver,
) -> Result<(AlignedDataset, AlignmentReport), AlignError> {
    let mut report = AlignmentReport::new(sparse.len(), CacheStatus::Disabled);
    let dataset = join(dense, sparse, cfg, observer, &mut report)?;
    Ok((dataset, report))
}

/// Aligns through `cache`, keyed by the content fingerprint of the inputs.
///
/// Unreadable cache entries count as a miss. A failed write is logged and
/// the computed dataset is returned anyway.
pub fn align_cached(
    dense: &DenseSeries,
    sparse: &SparseSeries,
    cfg: &AlignmentConfig,
    cache: &dyn AlignmentCache,
    observer: &mut dyn AlignmentObserver,
) -> Result<(AlignedDataset, AlignmentReport), AlignError> {
    let key = CacheKey::for_inputs(dense, sparse, cfg.match_tolerance, cfg.range_tolerance);

    let status = if cfg.cache_bypass {
        info!(
            component = "alignment",
            event = "cache.bypass",
            cache_key = key.as_str()
        );
        CacheStatus::Bypassed
    } else {
        match cache.get(&key) {
            Ok(Some(dataset)) => {
                info!(
                    component = "alignment",
                    event = "cache.hit",
                    cache_key = key.as_str(),
                    pairs = dataset.len()
                );
                let mut report = AlignmentReport::new(sparse.len(), CacheStatus::Hit);
                report.aligned = dataset.len() as u64;
                return Ok((dataset, report));
            }
            Ok(None) => {
                info!(
                    component = "alignment",
                    event = "cache.miss",
                    cache_key = key.as_str()
                );
                CacheStatus::Miss
            }
            Err(err) => {
                warn!(
                    component = "alignment",
                    event = "cache.corrupt",
                    cache_key = key.as_str(),
                    error = %err
                );
                CacheStatus::Corrupt
            }
        }
    };

    let mut report = AlignmentReport::new(sparse.len(), status);
    let dataset = join(dense, sparse, cfg, observer, &mut report)?;

    if let Err(err) = cache.put(&key, &dataset) {
        warn!(
            component = "alignment",
            event = "cache.write_failed",
            cache_key = key.as_str(),
            error = %err
        );
    } else {
        debug!(
            component = "alignment",
            event = "cache.write",
            cache_key = key.as_str(),
            pairs = dataset.len()
        );
    }

    Ok((dataset, report))
}

fn join(
    dense: &DenseSeries,
    sparse: &SparseSeries,
    cfg: &AlignmentConfig,
    observer: &mut dyn AlignmentObserver,
    report: &mut AlignmentReport,
) -> Result<AlignedDataset, AlignError> {
    let dense_range = range_of_dense(dense)?;
    let sparse_range = range_of_sparse(sparse)?;

    info!(
        component = "alignment",
        event = "alignment.start",
        dense_start = %dense_range.start(),
        dense_end = %dense_range.end(),
        sparse_start = %sparse_range.start(),
        sparse_end = %sparse_range.end(),
        dense_samples = dense.len(),
        sparse_records = sparse.len(),
        match_tolerance_ms = cfg.match_tolerance.num_milliseconds(),
        range_tolerance_ms = cfg.range_tolerance.num_milliseconds()
    );

    let mut dataset = AlignedDataset::empty(dense.channel_count());

    let reach = dense_range.widened(cfg.range_tolerance);
    let Some(window) = intersect(&reach, &sparse_range) else {
        warn!(
            component = "alignment",
            event = "alignment.overlap.empty",
            dense_start = %dense_range.start(),
            dense_end = %dense_range.end(),
            sparse_start = %sparse_range.start(),
            sparse_end = %sparse_range.end()
        );
        report.skipped_outside = sparse.len() as u64;
        return Ok(dataset);
    };
    report.overlap = Some(window);

    let total = sparse.len();
    for (position, record) in sparse.records().iter().enumerate() {
        match pair_record(dense, record, &window, cfg) {
            Ok(pair) => {
                report.in_overlap += 1;
                dataset.pairs.push(pair);
            }
            Err(reason) => {
                match reason {
                    SkipReason::OutsideOverlap => report.skipped_outside += 1,
                    SkipReason::NoDenseMatch => {
                        report.in_overlap += 1;
                        report.skipped_no_match += 1;
                    }
                    SkipReason::MissingChannels { .. } => {
                        report.in_overlap += 1;
                        report.skipped_missing_channels += 1;
                    }
                }
                observer.on_skip(position, record, reason);
            }
        }
        observer.on_progress(position + 1, total);
    }
    report.aligned = dataset.len() as u64;

    info!(
        component = "alignment",
        event = "alignment.finish",
        overlap_start = %window.start(),
        overlap_end = %window.end(),
        in_overlap = report.in_overlap,
        aligned = report.aligned,
        skipped_outside = report.skipped_outside,
        skipped_no_match = report.skipped_no_match,
        skipped_missing_channels = report.skipped_missing_channels
    );

    Ok(dataset)
}

fn pair_record(
    dense: &DenseSeries,
    record: &SparseRecord,
    window: &TimeRange,
    cfg: &AlignmentConfig,
) -> Result<AlignedPair, SkipReason> {
    if !window.contains(record.timestamp) {
        return Err(SkipReason::OutsideOverlap);
    }

    let hit = nearest_within(dense, record.timestamp, cfg.match_tolerance)
        .ok_or(SkipReason::NoDenseMatch)?;
    let channels = dense
        .channels(hit.index)
        .ok_or(SkipReason::MissingChannels { index: hit.index })?;

    Ok(AlignedPair {
        timestamp: record.timestamp,
        channels: channels.to_vec(),
        ground_truth: record.value,
        tag: record.tag.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::SeriesKind;
    use chrono::{TimeZone, Utc};

    fn ts_ms(ms: i64) -> Timestamp {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    fn dense_1s(values: &[f64]) -> DenseSeries {
        let timestamps = (0..values.len() as i64).map(|s| ts_ms(s * 1_000)).collect();
        let rows = values.iter().map(|v| vec![*v]).collect();
        DenseSeries::new(1, timestamps, rows).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        skips: Vec<(usize, SkipReason)>,
        progress: Vec<(usize, usize)>,
    }

    impl AlignmentObserver for Recorder {
        fn on_skip(&mut self, position: usize, _record: &SparseRecord, reason: SkipReason) {
            self.skips.push((position, reason));
        }

        fn on_progress(&mut self, done: usize, total: usize) {
            self.progress.push((done, total));
        }
    }

    #[test]
    fn records_outside_overlap_and_without_match_are_dropped() {
        let dense = dense_1s(&[10.0, 20.0, 30.0, 40.0, 50.0]);
        let sparse = SparseSeries::new(vec![
            SparseRecord::new(ts_ms(1_400), 5.0),
            SparseRecord::new(ts_ms(10_000), 9.0),
        ]);

        let mut recorder = Recorder::default();
        let (dataset, report) =
            align(&dense, &sparse, &AlignmentConfig::default(), &mut recorder).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.pairs[0].timestamp, ts_ms(1_400));
        assert_eq!(dataset.pairs[0].channels, vec![20.0]);
        assert_eq!(dataset.pairs[0].ground_truth, 5.0);
        assert_eq!(recorder.skips, vec![(1, SkipReason::OutsideOverlap)]);
        assert_eq!(recorder.progress, vec![(1, 2), (2, 2)]);
        assert_eq!(report.aligned, 1);
        assert_eq!(report.skipped_outside, 1);
        assert_eq!(report.overlap.unwrap().start(), ts_ms(1_400));
        assert_eq!(report.overlap.unwrap().end(), ts_ms(4_000));
    }

    #[test]
    fn match_tolerance_is_independent_of_range_tolerance() {
        let dense = DenseSeries::new(
            1,
            vec![ts_ms(0), ts_ms(10_000)],
            vec![vec![1.0], vec![2.0]],
        )
        .unwrap();
        let sparse = SparseSeries::new(vec![
            SparseRecord::new(ts_ms(5_000), 1.0),
            SparseRecord::new(ts_ms(10_500), 2.0),
        ]);
        let cfg = AlignmentConfig {
            range_tolerance: ChronoDuration::seconds(1),
            ..AlignmentConfig::default()
        };

        let mut recorder = Recorder::default();
        let (dataset, report) = align(&dense, &sparse, &cfg, &mut recorder).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.pairs[0].channels, vec![2.0]);
        assert_eq!(recorder.skips, vec![(0, SkipReason::NoDenseMatch)]);
        assert_eq!(report.skipped_no_match, 1);
    }

    #[test]
    fn missing_channel_rows_are_skipped_not_trusted() {
        let dense = DenseSeries::new(1, vec![ts_ms(0), ts_ms(1_000)], vec![vec![1.0]]).unwrap();
        let sparse = SparseSeries::new(vec![
            SparseRecord::new(ts_ms(0), 1.0),
            SparseRecord::new(ts_ms(1_000), 2.0),
        ]);

        let mut recorder = Recorder::default();
        let (dataset, report) =
            align(&dense, &sparse, &AlignmentConfig::default(), &mut recorder).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(
            recorder.skips,
            vec![(1, SkipReason::MissingChannels { index: 1 })]
        );
        assert_eq!(report.skipped_missing_channels, 1);
    }

    #[test]
    fn empty_inputs_error_but_disjoint_ranges_are_empty() {
        let dense = dense_1s(&[1.0, 2.0]);
        let err = align(
            &dense,
            &SparseSeries::default(),
            &AlignmentConfig::default(),
            &mut NoopObserver,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AlignError::Range(RangeError::IncompleteRange {
                series: SeriesKind::Sparse
            })
        ));

        let sparse = SparseSeries::new(vec![SparseRecord::new(ts_ms(60_000), 1.0)]);
        let (dataset, report) =
            align(&dense, &sparse, &AlignmentConfig::default(), &mut NoopObserver).unwrap();
        assert!(dataset.is_empty());
        assert_eq!(dataset.channel_count, 1);
        assert!(report.overlap.is_none());
        assert_eq!(report.skipped_outside, 1);
    }

    #[test]
    fn range_tolerance_bridges_a_small_gap_between_ranges() {
        let dense = dense_1s(&[1.0, 2.0]);
        let sparse = SparseSeries::new(vec![
            SparseRecord::new(ts_ms(1_300), 4.0),
            SparseRecord::new(ts_ms(1_900), 6.0),
        ]);

        let (dataset, report) =
            align(&dense, &sparse, &AlignmentConfig::default(), &mut NoopObserver).unwrap();
        assert!(dataset.is_empty());
        assert!(report.overlap.is_none());

        let cfg = AlignmentConfig {
            range_tolerance: ChronoDuration::milliseconds(500),
            ..AlignmentConfig::default()
        };
        let (dataset, report) = align(&dense, &sparse, &cfg, &mut NoopObserver).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.pairs[0].timestamp, ts_ms(1_300));
        assert_eq!(dataset.pairs[0].channels, vec![2.0]);
        assert_eq!(report.skipped_outside, 1);
        assert_eq!(report.overlap.unwrap().start(), ts_ms(1_300));
        assert_eq!(report.overlap.unwrap().end(), ts_ms(1_500));
    }

    #[test]
    fn tags_are_carried_through() {
        let dense = dense_1s(&[1.0, 2.0]);
        let sparse = SparseSeries::new(vec![
            SparseRecord::new(ts_ms(1_000), 3.5).with_tag("Temperature", "21.4")
        ]);
        let (dataset, _) =
            align(&dense, &sparse, &AlignmentConfig::default(), &mut NoopObserver).unwrap();
        assert_eq!(
            dataset.pairs[0].tag.get("Temperature").map(String::as_str),
            Some("21.4")
        );
    }
}
