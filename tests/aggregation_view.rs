use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use radar_moisture::{
    align, aggregation_view, group_by_ground_truth, AggregationError, AggregationMode,
    AggregationOutput, AlignedDataset, AlignedPair, AlignmentConfig, ChannelSelection,
    DenseSeries, GroupingRule, NoopObserver, SparseRecord, SparseSeries,
};

fn pair(second: i64, channels: &[f64], ground_truth: f64) -> AlignedPair {
    AlignedPair {
        timestamp: Utc.timestamp_opt(second, 0).single().unwrap(),
        channels: channels.to_vec(),
        ground_truth,
        tag: BTreeMap::new(),
    }
}

fn sample_dataset() -> AlignedDataset {
    AlignedDataset {
        channel_count: 3,
        pairs: vec![
            pair(0, &[1.0, 2.0, 3.0], 10.0),
            pair(1, &[3.0, 4.0, 5.0], 10.0),
            pair(2, &[0.5, 0.25, 8.0], 12.5),
            pair(3, &[7.0, 1.0, 1.0], 11.0),
            pair(4, &[9.0, 9.0, 9.0], 12.5),
        ],
    }
}

fn aggregate(output: AggregationOutput) -> (Vec<f64>, Vec<f64>) {
    match output {
        AggregationOutput::Aggregate(line) => (line.ground_truth, line.values),
        AggregationOutput::Individual(_) => panic!("expected aggregate output"),
    }
}

#[test]
fn aggregate_total_matches_sum_of_individual_totals() {
    let dataset = sample_dataset();
    for selection in [
        ChannelSelection::All,
        ChannelSelection::Subset(vec![1, 3]),
        ChannelSelection::Subset(vec![2]),
    ] {
        let (_, values) = aggregate(
            aggregation_view(
                &dataset,
                AggregationMode::Aggregate,
                &selection,
                GroupingRule::Exact,
            )
            .unwrap(),
        );
        let AggregationOutput::Individual(lines) = aggregation_view(
            &dataset,
            AggregationMode::Individual,
            &selection,
            GroupingRule::Exact,
        )
        .unwrap() else {
            panic!("expected individual output");
        };

        let aggregate_total: f64 = values.iter().sum();
        let individual_total: f64 = lines.iter().map(|line| line.line.total()).sum();
        assert!(
            (aggregate_total - individual_total).abs() < 1e-9,
            "{selection:?}: {aggregate_total} vs {individual_total}"
        );
    }
}

#[test]
fn groups_are_ascending_with_element_wise_means() {
    let groups = group_by_ground_truth(&sample_dataset(), GroupingRule::Exact).unwrap();
    let keys: Vec<f64> = groups.iter().map(|group| group.ground_truth).collect();
    assert_eq!(keys, vec![10.0, 11.0, 12.5]);
    assert_eq!(groups[0].mean_channels, vec![2.0, 3.0, 4.0]);
    assert_eq!(groups[0].observations, 2);
    assert_eq!(groups[2].mean_channels, vec![4.75, 4.625, 8.5]);
}

#[test]
fn individual_lines_follow_requested_channels() {
    let AggregationOutput::Individual(lines) = aggregation_view(
        &sample_dataset(),
        AggregationMode::Individual,
        &ChannelSelection::Subset(vec![3, 1]),
        GroupingRule::Exact,
    )
    .unwrap() else {
        panic!("expected individual output");
    };

    let channels: Vec<usize> = lines.iter().map(|line| line.channel).collect();
    assert_eq!(channels, vec![3, 1]);
    assert_eq!(lines[0].line.values, vec![4.0, 1.0, 8.5]);
    assert_eq!(lines[1].line.ground_truth, vec![10.0, 11.0, 12.5]);
}

#[test]
fn quantized_grouping_merges_nearby_values() {
    let dataset = sample_dataset();
    let groups = group_by_ground_truth(&dataset, GroupingRule::Quantized { step: 5.0 }).unwrap();
    let keys: Vec<f64> = groups.iter().map(|group| group.ground_truth).collect();
    // 10 and 11 round to bucket 2, 12.5 rounds to bucket 3
    assert_eq!(keys, vec![10.0, 15.0]);
    assert_eq!(groups[0].observations, 3);
}

#[test]
fn five_sample_scenario_aggregates_to_single_point() {
    let dense = DenseSeries::new(
        1,
        (0..5).map(|i| Utc.timestamp_opt(i, 0).single().unwrap()).collect(),
        (1..=5).map(|i| vec![(i * 10) as f64]).collect(),
    )
    .unwrap();
    let sparse = SparseSeries::new(vec![
        SparseRecord::new(Utc.timestamp_millis_opt(1_400).single().unwrap(), 5.0),
        SparseRecord::new(Utc.timestamp_opt(10, 0).single().unwrap(), 9.0),
    ]);
    let (dataset, _) = align(&dense, &sparse, &AlignmentConfig::default(), &mut NoopObserver)
        .unwrap();

    let (ground_truth, values) = aggregate(
        aggregation_view(
            &dataset,
            AggregationMode::Aggregate,
            &ChannelSelection::All,
            GroupingRule::Exact,
        )
        .unwrap(),
    );
    assert_eq!(ground_truth, vec![5.0]);
    assert_eq!(values, vec![20.0]);
}

#[test]
fn empty_or_out_of_range_subset_is_configuration_error() {
    let dataset = sample_dataset();
    for selection in [
        ChannelSelection::Subset(vec![]),
        ChannelSelection::Subset(vec![0]),
        ChannelSelection::Subset(vec![4]),
    ] {
        let err = aggregation_view(
            &dataset,
            AggregationMode::Aggregate,
            &selection,
            GroupingRule::Exact,
        )
        .unwrap_err();
        assert!(matches!(err, AggregationError::Configuration(_)), "{selection:?}");
    }

    assert!(matches!(
        ChannelSelection::parse(Some("x, y"), 3),
        Err(AggregationError::Configuration(_))
    ));
    assert_eq!(
        ChannelSelection::parse(Some("2, abc, 3"), 3).unwrap(),
        ChannelSelection::Subset(vec![2, 3])
    );
}

#[test]
fn empty_dataset_yields_empty_views() {
    let dataset = AlignedDataset::empty(3);
    let (ground_truth, values) = aggregate(
        aggregation_view(
            &dataset,
            AggregationMode::Aggregate,
            &ChannelSelection::All,
            GroupingRule::Exact,
        )
        .unwrap(),
    );
    assert!(ground_truth.is_empty());
    assert!(values.is_empty());
}
