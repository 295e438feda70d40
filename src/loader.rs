//! CSV loaders for the dense radar series and the sparse environment log.

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use csv::StringRecord;
use thiserror::Error;
use tracing::{debug, info};

use crate::series::{DenseSeries, SeriesError, SparseRecord, SparseSeries, Timestamp};

const LOCAL_TIMESTAMP_FORMATS: [&str; 7] = [
    "%m/%d/%y %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenseCsvConfig {
    /// When set, files with a different channel count are rejected.
    pub expected_channel_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseCsvConfig {
    pub timestamp_column: String,
    pub value_column: String,
    /// Data rows dropped after the header, e.g. a units row.
    pub skip_rows: usize,
    /// Zone used for timestamps written as local wall-clock time.
    pub timezone: Tz,
}

impl Default for SparseCsvConfig {
    fn default() -> Self {
        Self {
            timestamp_column: "TIMESTAMP".to_string(),
            value_column: "Leaf Moisture".to_string(),
            skip_rows: 0,
            timezone: chrono_tz::UTC,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("dense file has no channel columns")]
    NoChannels,
    #[error("column '{column}' not found in header")]
    MissingColumn { column: String },
    #[error("line {line}: expected {expected} fields, found {found}")]
    DataShape {
        line: u64,
        found: usize,
        expected: usize,
    },
    #[error("line {line}: failed to parse field {field} value '{value}'")]
    ParseField {
        line: u64,
        field: String,
        value: String,
    },
    #[error("line {line}: unrecognized timestamp '{value}'")]
    InvalidTimestamp { line: u64, value: String },
    #[error(transparent)]
    Series(#[from] SeriesError),
}

/// Loads a dense series: header row, Unix timestamp first, one column per channel.
pub fn load_dense_csv(path: &Path, cfg: &DenseCsvConfig) -> Result<DenseSeries, LoadError> {
    let body = fs::read(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_slice());

    let headers = reader.headers()?.clone();
    let channel_count = headers.len().saturating_sub(1);
    if channel_count == 0 {
        return Err(LoadError::NoChannels);
    }
    if let Some(expected) = cfg.expected_channel_count {
        if expected != channel_count {
            return Err(LoadError::DataShape {
                line: 1,
                found: channel_count + 1,
                expected: expected + 1,
            });
        }
    }

    let mut timestamps = Vec::new();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = line_of(&record);
        if record.len() != channel_count + 1 {
            return Err(LoadError::DataShape {
                line,
                found: record.len(),
                expected: channel_count + 1,
            });
        }

        let raw_ts = record.get(0).unwrap_or_default();
        let seconds = parse_f64(raw_ts, line, headers.get(0).unwrap_or("timestamp"))?;
        timestamps.push(epoch_to_timestamp(seconds).ok_or_else(|| {
            LoadError::InvalidTimestamp {
                line,
                value: raw_ts.to_string(),
            }
        })?);

        let mut channels = Vec::with_capacity(channel_count);
        for (idx, raw) in record.iter().enumerate().skip(1) {
            channels.push(parse_f64(raw, line, headers.get(idx).unwrap_or("channel"))?);
        }
        rows.push(channels);
    }

    let series = DenseSeries::new(channel_count, timestamps, rows)?;
    info!(
        component = "loader",
        event = "loader.dense.finish",
        path = %path.display(),
        samples = series.len(),
        channel_count
    );
    Ok(series)
}

/// Loads the sparse ground-truth log. Columns other than the timestamp and
/// value columns are carried through as the record tag.
pub fn load_sparse_csv(path: &Path, cfg: &SparseCsvConfig) -> Result<SparseSeries, LoadError> {
    let body = fs::read(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_slice());

    let headers = reader.headers()?.clone();
    let ts_idx = column_index(&headers, &cfg.timestamp_column)?;
    let value_idx = column_index(&headers, &cfg.value_column)?;

    let mut records = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if row < cfg.skip_rows {
            debug!(
                component = "loader",
                event = "loader.sparse.row_skipped",
                line = line_of(&record)
            );
            continue;
        }
        let line = line_of(&record);

        let raw_ts = record.get(ts_idx).unwrap_or_default();
        let timestamp =
            parse_timestamp(raw_ts, cfg.timezone).ok_or_else(|| LoadError::InvalidTimestamp {
                line,
                value: raw_ts.to_string(),
            })?;
        let value = parse_f64(
            record.get(value_idx).unwrap_or_default(),
            line,
            &cfg.value_column,
        )?;

        let mut sparse = SparseRecord::new(timestamp, value);
        for (idx, header) in headers.iter().enumerate() {
            if idx == ts_idx || idx == value_idx {
                continue;
            }
            let value = record.get(idx).unwrap_or_default();
            sparse.tag.insert(header.to_string(), value.to_string());
        }
        records.push(sparse);
    }

    info!(
        component = "loader",
        event = "loader.sparse.finish",
        path = %path.display(),
        records = records.len(),
        value_column = %cfg.value_column,
        timezone = %cfg.timezone
    );
    Ok(SparseSeries::new(records))
}

/// Accepts RFC 3339, Unix epoch numbers, or common logger wall-clock formats
/// interpreted in `tz`.
pub fn parse_timestamp(raw: &str, tz: Tz) -> Option<Timestamp> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    if let Ok(epoch) = raw.parse::<f64>() {
        return epoch_to_timestamp(epoch);
    }

    LOCAL_TIMESTAMP_FORMATS.iter().find_map(|format| {
        let naive = NaiveDateTime::parse_from_str(raw, format).ok()?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    })
}

/// Interprets an epoch number as seconds, milliseconds or microseconds by
/// magnitude.
pub fn epoch_to_timestamp(value: f64) -> Option<Timestamp> {
    if !value.is_finite() {
        return None;
    }
    let micros = if value.abs() >= 1.0e15 {
        value
    } else if value.abs() >= 1.0e12 {
        value * 1_000.0
    } else {
        value * 1_000_000.0
    };
    DateTime::from_timestamp_micros(micros.round() as i64)
}

fn column_index(headers: &StringRecord, column: &str) -> Result<usize, LoadError> {
    headers
        .iter()
        .position(|header| header == column)
        .ok_or_else(|| LoadError::MissingColumn {
            column: column.to_string(),
        })
}

fn parse_f64(raw: &str, line: u64, field: &str) -> Result<f64, LoadError> {
    raw.parse::<f64>().map_err(|_| LoadError::ParseField {
        line,
        field: field.to_string(),
        value: raw.to_string(),
    })
}

fn line_of(record: &StringRecord) -> u64 {
    record.position().map(|pos| pos.line()).unwrap_or_default()
}
