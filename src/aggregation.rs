//! Grouping aligned pairs by ground truth and projecting channel series.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::alignment::{AlignedDataset, AlignedPair};

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

/// How ground-truth values are bucketed into groups.
///
/// `Exact` compares values bit-for-bit (with `-0.0 == 0.0`), which is fragile
/// for values that went through floating point arithmetic. `Quantized` groups
/// by `round(value / step)` and reports the bucket centre `bucket * step`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum GroupingRule {
    #[default]
    Exact,
    Quantized { step: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationMode {
    Aggregate,
    Individual,
}

impl AggregationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Individual => "individual",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelSelection {
    #[default]
    All,
    /// 1-based channel indices, in request order.
    Subset(Vec<usize>),
}

impl ChannelSelection {
    /// Parses a comma separated list of 1-based channel indices.
    ///
    /// `None` selects every channel. An explicitly empty list, or one where
    /// every entry was unusable, is a configuration error. Non-numeric entries
    /// are skipped with a warning; numeric entries outside `1..=channel_count`
    /// are rejected.
    pub fn parse(raw: Option<&str>, channel_count: usize) -> Result<Self, AggregationError> {
        let Some(raw) = raw else {
            return Ok(Self::All);
        };

        let mut indices = Vec::new();
        for token in raw.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.parse::<usize>() {
                Ok(index) => indices.push(index),
                Err(_) => warn!(
                    component = "aggregation",
                    event = "aggregation.channel.skipped",
                    token,
                    reason = "not_numeric"
                ),
            }
        }

        Self::from_indices(indices, channel_count)
    }

    pub fn from_indices(
        indices: Vec<usize>,
        channel_count: usize,
    ) -> Result<Self, AggregationError> {
        if indices.is_empty() {
            return Err(AggregationError::Configuration(
                "channel subset must not be empty".to_string(),
            ));
        }
        if let Some(bad) = indices
            .iter()
            .find(|index| **index == 0 || **index > channel_count)
        {
            return Err(AggregationError::Configuration(format!(
                "channel {bad} is outside 1..={channel_count}"
            )));
        }
        Ok(Self::Subset(indices))
    }

    /// Zero-based indices this selection resolves to.
    pub fn zero_based(&self, channel_count: usize) -> Vec<usize> {
        match self {
            Self::All => (0..channel_count).collect(),
            Self::Subset(indices) => indices
                .iter()
                .filter_map(|index| index.checked_sub(1))
                .collect(),
        }
    }
}

/// One ground-truth group: the element-wise mean of its members' channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedAggregate {
    pub ground_truth: f64,
    pub mean_channels: Vec<f64>,
    pub observations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesLine {
    pub ground_truth: Vec<f64>,
    pub values: Vec<f64>,
}

impl SeriesLine {
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.ground_truth
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLine {
    /// 1-based channel index.
    pub channel: usize,
    pub line: SeriesLine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregationOutput {
    Aggregate(SeriesLine),
    Individual(Vec<ChannelLine>),
}

pub fn validate_grouping_rule(rule: GroupingRule) -> Result<(), AggregationError> {
    match rule {
        GroupingRule::Exact => Ok(()),
        GroupingRule::Quantized { step } if step.is_finite() && step > 0.0 => Ok(()),
        GroupingRule::Quantized { step } => Err(AggregationError::Configuration(format!(
            "quantization step must be finite and > 0, got {step}"
        ))),
    }
}

/// Groups pairs by ground truth, ascending.
pub fn group_by_ground_truth(
    dataset: &AlignedDataset,
    rule: GroupingRule,
) -> Result<Vec<GroupedAggregate>, AggregationError> {
    validate_grouping_rule(rule)?;

    let mut keyed: Vec<(GroupKey, &AlignedPair)> = dataset
        .pairs
        .iter()
        .map(|pair| (GroupKey::new(pair.ground_truth, rule), pair))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut groups: Vec<GroupedAggregate> = Vec::new();
    let mut current: Option<(GroupKey, Vec<f64>, usize)> = None;

    for (key, pair) in keyed {
        match current.as_mut() {
            Some((current_key, sums, count)) if *current_key == key => {
                accumulate(sums, &pair.channels);
                *count += 1;
            }
            _ => {
                if let Some((done_key, sums, count)) = current.take() {
                    groups.push(finish_group(done_key, sums, count));
                }
                let mut sums = vec![0.0; dataset.channel_count];
                accumulate(&mut sums, &pair.channels);
                current = Some((key, sums, 1));
            }
        }
    }
    if let Some((done_key, sums, count)) = current {
        groups.push(finish_group(done_key, sums, count));
    }

    info!(
        component = "aggregation",
        event = "aggregation.grouped",
        pairs = dataset.len(),
        groups = groups.len(),
        rule = ?rule
    );

    Ok(groups)
}

/// Sums the selected mean channels of each group into one value.
pub fn aggregate_series(
    groups: &[GroupedAggregate],
    selection: &ChannelSelection,
    channel_count: usize,
) -> Result<SeriesLine, AggregationError> {
    let indices = resolve_selection(groups, selection, channel_count)?;
    Ok(SeriesLine {
        ground_truth: groups.iter().map(|group| group.ground_truth).collect(),
        values: groups
            .iter()
            .map(|group| indices.iter().map(|idx| group.mean_channels[*idx]).sum())
            .collect(),
    })
}

/// One line per selected channel, each across all groups.
pub fn individual_series(
    groups: &[GroupedAggregate],
    selection: &ChannelSelection,
    channel_count: usize,
) -> Result<Vec<ChannelLine>, AggregationError> {
    let indices = resolve_selection(groups, selection, channel_count)?;
    let ground_truth: Vec<f64> = groups.iter().map(|group| group.ground_truth).collect();
    Ok(indices
        .into_iter()
        .map(|idx| ChannelLine {
            channel: idx + 1,
            line: SeriesLine {
                ground_truth: ground_truth.clone(),
                values: groups.iter().map(|group| group.mean_channels[idx]).collect(),
            },
        })
        .collect())
}

pub fn aggregation_view(
    dataset: &AlignedDataset,
    mode: AggregationMode,
    selection: &ChannelSelection,
    rule: GroupingRule,
) -> Result<AggregationOutput, AggregationError> {
    let groups = group_by_ground_truth(dataset, rule)?;
    let output = match mode {
        AggregationMode::Aggregate => AggregationOutput::Aggregate(aggregate_series(
            &groups,
            selection,
            dataset.channel_count,
        )?),
        AggregationMode::Individual => AggregationOutput::Individual(individual_series(
            &groups,
            selection,
            dataset.channel_count,
        )?),
    };
    Ok(output)
}

/// Zero-based indices for `selection`, checked against `channel_count` and
/// against every group's channel width.
fn resolve_selection(
    groups: &[GroupedAggregate],
    selection: &ChannelSelection,
    channel_count: usize,
) -> Result<Vec<usize>, AggregationError> {
    if let ChannelSelection::Subset(indices) = selection {
        ChannelSelection::from_indices(indices.clone(), channel_count)?;
    }
    if let Some(group) = groups
        .iter()
        .find(|group| group.mean_channels.len() != channel_count)
    {
        return Err(AggregationError::Configuration(format!(
            "group {} has {} channels, expected {channel_count}",
            group.ground_truth,
            group.mean_channels.len()
        )));
    }
    Ok(selection.zero_based(channel_count))
}

#[derive(Debug, Clone, Copy)]
enum GroupKey {
    Exact(f64),
    Bucket(i64, f64),
}

impl GroupKey {
    fn new(value: f64, rule: GroupingRule) -> Self {
        match rule {
            GroupingRule::Exact => Self::Exact(if value == 0.0 { 0.0 } else { value }),
            GroupingRule::Quantized { step } => {
                let scaled = (value / step).round();
                // Non-finite and out-of-range values keep their own exact key.
                if scaled.is_finite() && scaled >= i64::MIN as f64 && scaled < i64::MAX as f64 {
                    Self::Bucket(scaled as i64, step)
                } else {
                    Self::Exact(value)
                }
            }
        }
    }

    fn value(self) -> f64 {
        match self {
            Self::Exact(value) => value,
            Self::Bucket(bucket, step) => bucket as f64 * step,
        }
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bucket(a, _), Self::Bucket(b, _)) => a.cmp(b),
            _ => self.value().total_cmp(&other.value()),
        }
    }
}

fn accumulate(sums: &mut [f64], channels: &[f64]) {
    for (sum, value) in sums.iter_mut().zip(channels) {
        *sum += *value;
    }
}

fn finish_group(key: GroupKey, mut sums: Vec<f64>, count: usize) -> GroupedAggregate {
    for sum in &mut sums {
        *sum /= count as f64;
    }
    GroupedAggregate {
        ground_truth: key.value(),
        mean_channels: sums,
        observations: count,
    }
}
