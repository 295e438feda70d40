//! CSV writers for aligned datasets and aggregation views.

use std::io::Write;

use thiserror::Error;

use crate::aggregation::AggregationOutput;
use crate::alignment::AlignedDataset;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes one row per ground-truth group.
///
/// Aggregate views have a single `value` column; individual views get one
/// `channel_<n>` column per selected channel.
pub fn write_aggregation_csv<W: Write>(
    output: &AggregationOutput,
    writer: W,
) -> Result<(), ExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    match output {
        AggregationOutput::Aggregate(line) => {
            csv.write_record(["ground_truth", "value"])?;
            for (ground_truth, value) in line.points() {
                csv.write_record([ground_truth.to_string(), value.to_string()])?;
            }
        }
        AggregationOutput::Individual(lines) => {
            let mut header = vec!["ground_truth".to_string()];
            header.extend(lines.iter().map(|line| format!("channel_{}", line.channel)));
            csv.write_record(&header)?;

            let groups = lines
                .first()
                .map(|line| line.line.ground_truth.len())
                .unwrap_or(0);
            for group in 0..groups {
                let mut record = vec![lines[0].line.ground_truth[group].to_string()];
                record.extend(
                    lines
                        .iter()
                        .map(|line| line.line.values[group].to_string()),
                );
                csv.write_record(&record)?;
            }
        }
    }
    csv.flush()?;
    Ok(())
}

/// Writes every aligned pair: timestamp, ground truth, then all channels.
pub fn write_aligned_pairs_csv<W: Write>(
    dataset: &AlignedDataset,
    writer: W,
) -> Result<(), ExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    let mut header = vec!["timestamp".to_string(), "ground_truth".to_string()];
    header.extend((1..=dataset.channel_count).map(|channel| format!("channel_{channel}")));
    csv.write_record(&header)?;

    for pair in &dataset.pairs {
        let mut record = Vec::with_capacity(pair.channels.len() + 2);
        record.push(pair.timestamp.to_rfc3339());
        record.push(pair.ground_truth.to_string());
        record.extend(pair.channels.iter().map(|value| value.to_string()));
        csv.write_record(&record)?;
    }
    csv.flush()?;
    Ok(())
}
