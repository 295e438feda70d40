//! Fingerprint-keyed storage for aligned datasets.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::alignment::{AlignedDataset, AlignedPair};
use crate::series::{DenseSeries, SparseSeries, Timestamp};

pub const CACHE_SCHEMA_VERSION: u32 = 2;

const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache payload for {key} is unreadable: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache payload encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("cache entry {key} has schema version {actual}, expected {expected}")]
    SchemaVersion {
        key: String,
        expected: u32,
        actual: u32,
    },
}

/// Content fingerprint of one alignment input combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_inputs(
        dense: &DenseSeries,
        sparse: &SparseSeries,
        match_tolerance: ChronoDuration,
        range_tolerance: ChronoDuration,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("schema:{CACHE_SCHEMA_VERSION};"));

        hasher.update(format!(
            "dense:{}:{}:{};",
            dense.channel_count(),
            dense.len(),
            dense.row_count()
        ));
        for ts in dense.timestamps() {
            hasher.update(ts.timestamp().to_le_bytes());
            hasher.update(ts.timestamp_subsec_nanos().to_le_bytes());
        }
        for idx in 0..dense.row_count() {
            for value in dense.channels(idx).unwrap_or_default() {
                hasher.update(value.to_bits().to_le_bytes());
            }
        }

        hasher.update(format!(";sparse:{};", sparse.len()));
        for record in sparse.records() {
            hasher.update(record.timestamp.timestamp().to_le_bytes());
            hasher.update(record.timestamp.timestamp_subsec_nanos().to_le_bytes());
            hasher.update(record.value.to_bits().to_le_bytes());
            for (key, value) in &record.tag {
                hasher.update(format!("{}={}|", key.len(), key));
                hasher.update(format!("{}={}|", value.len(), value));
            }
            hasher.update(";");
        }

        hasher.update(format!(
            "match_tolerance:{}.{:09};range_tolerance:{}.{:09};",
            match_tolerance.num_seconds(),
            match_tolerance.subsec_nanos(),
            range_tolerance.num_seconds(),
            range_tolerance.subsec_nanos()
        ));

        Self(hex::encode(hasher.finalize()))
    }

    pub fn from_hex(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub trait AlignmentCache {
    fn get(&self, key: &CacheKey) -> Result<Option<AlignedDataset>, CacheError>;
    fn put(&self, key: &CacheKey, dataset: &AlignedDataset) -> Result<(), CacheError>;
}

/// Single-file SQLite store. Each write runs in its own transaction, so
/// concurrent processes never see a half-written entry.
pub struct SqliteAlignmentCache {
    path: PathBuf,
    conn: Connection,
}

impl SqliteAlignmentCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS aligned_datasets (
                cache_key TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                pair_count INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            ",
        )?;

        info!(
            component = "cache",
            event = "cache.open",
            path = %path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> Result<u64, CacheError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM aligned_datasets", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.conn.execute("DELETE FROM aligned_datasets", [])?;
        Ok(())
    }

    /// Overwrites the stored payload verbatim.
    pub fn put_raw(&self, key: &CacheKey, payload: &str) -> Result<(), CacheError> {
        self.write_entry(key, payload, 0)
    }

    fn write_entry(
        &self,
        key: &CacheKey,
        payload: &str,
        pair_count: usize,
    ) -> Result<(), CacheError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "
            INSERT OR REPLACE INTO aligned_datasets
                (cache_key, schema_version, pair_count, created_at_ms, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                key.as_str(),
                CACHE_SCHEMA_VERSION,
                pair_count as i64,
                Utc::now().timestamp_millis(),
                payload
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl AlignmentCache for SqliteAlignmentCache {
    fn get(&self, key: &CacheKey) -> Result<Option<AlignedDataset>, CacheError> {
        let row: Option<(u32, String)> = self
            .conn
            .query_row(
                "SELECT schema_version, payload FROM aligned_datasets WHERE cache_key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((schema_version, payload)) = row else {
            return Ok(None);
        };
        if schema_version != CACHE_SCHEMA_VERSION {
            return Err(CacheError::SchemaVersion {
                key: key.as_str().to_string(),
                expected: CACHE_SCHEMA_VERSION,
                actual: schema_version,
            });
        }

        decode(key, &payload).map(Some)
    }

    fn put(&self, key: &CacheKey, dataset: &AlignedDataset) -> Result<(), CacheError> {
        let payload = encode(dataset)?;
        self.write_entry(key, &payload, dataset.pairs.len())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAlignmentCache {
    entries: Mutex<HashMap<CacheKey, String>>,
}

impl InMemoryAlignmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("in-memory cache lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put_raw(&self, key: &CacheKey, payload: impl Into<String>) {
        self.entries
            .lock()
            .expect("in-memory cache lock should not be poisoned")
            .insert(key.clone(), payload.into());
    }
}

impl AlignmentCache for InMemoryAlignmentCache {
    fn get(&self, key: &CacheKey) -> Result<Option<AlignedDataset>, CacheError> {
        let payload = self
            .entries
            .lock()
            .expect("in-memory cache lock should not be poisoned")
            .get(key)
            .cloned();
        payload.map(|raw| decode(key, &raw)).transpose()
    }

    fn put(&self, key: &CacheKey, dataset: &AlignedDataset) -> Result<(), CacheError> {
        let payload = encode(dataset)?;
        self.put_raw(key, payload);
        Ok(())
    }
}

/// Stored form of an [`AlignedDataset`]. Floats are kept as IEEE-754 bit
/// patterns so NaN and infinities survive the JSON payload unchanged.
#[derive(Serialize, Deserialize)]
struct StoredDataset {
    channel_count: usize,
    pairs: Vec<StoredPair>,
}

#[derive(Serialize, Deserialize)]
struct StoredPair {
    timestamp: Timestamp,
    channels: Vec<u64>,
    ground_truth: u64,
    tag: BTreeMap<String, String>,
}

impl From<&AlignedDataset> for StoredDataset {
    fn from(dataset: &AlignedDataset) -> Self {
        Self {
            channel_count: dataset.channel_count,
            pairs: dataset
                .pairs
                .iter()
                .map(|pair| StoredPair {
                    timestamp: pair.timestamp,
                    channels: pair.channels.iter().map(|value| value.to_bits()).collect(),
                    ground_truth: pair.ground_truth.to_bits(),
                    tag: pair.tag.clone(),
                })
                .collect(),
        }
    }
}

impl From<StoredDataset> for AlignedDataset {
    fn from(stored: StoredDataset) -> Self {
        Self {
            channel_count: stored.channel_count,
            pairs: stored
                .pairs
                .into_iter()
                .map(|pair| AlignedPair {
                    timestamp: pair.timestamp,
                    channels: pair.channels.into_iter().map(f64::from_bits).collect(),
                    ground_truth: f64::from_bits(pair.ground_truth),
                    tag: pair.tag,
                })
                .collect(),
        }
    }
}

fn encode(dataset: &AlignedDataset) -> Result<String, CacheError> {
    serde_json::to_string(&StoredDataset::from(dataset)).map_err(CacheError::Encode)
}

fn decode(key: &CacheKey, payload: &str) -> Result<AlignedDataset, CacheError> {
    serde_json::from_str::<StoredDataset>(payload)
        .map(AlignedDataset::from)
        .map_err(|source| CacheError::Corrupt {
            key: key.as_str().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::AlignedPair;
    use crate::series::SparseRecord;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(secs: i64) -> crate::series::Timestamp {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn dense(values: &[f64]) -> DenseSeries {
        let timestamps = (0..values.len() as i64).map(ts).collect();
        let rows = values.iter().map(|v| vec![*v]).collect();
        DenseSeries::new(1, timestamps, rows).unwrap()
    }

    fn sparse() -> SparseSeries {
        SparseSeries::new(vec![SparseRecord::new(ts(1), 5.0).with_tag("site", "a")])
    }

    fn dataset() -> AlignedDataset {
        AlignedDataset {
            channel_count: 1,
            pairs: vec![AlignedPair {
                timestamp: ts(1),
                channels: vec![20.0],
                ground_truth: 5.0,
                tag: Default::default(),
            }],
        }
    }

    fn secs(v: i64) -> ChronoDuration {
        ChronoDuration::seconds(v)
    }

    #[test]
    fn key_is_stable_for_identical_inputs() {
        let a = CacheKey::for_inputs(&dense(&[1.0, 2.0]), &sparse(), secs(1), secs(0));
        let b = CacheKey::for_inputs(&dense(&[1.0, 2.0]), &sparse(), secs(1), secs(0));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn key_changes_with_content_and_tolerances() {
        let base = CacheKey::for_inputs(&dense(&[1.0, 2.0]), &sparse(), secs(1), secs(0));
        let other_dense = CacheKey::for_inputs(&dense(&[1.0, 3.0]), &sparse(), secs(1), secs(0));
        let other_sparse = CacheKey::for_inputs(
            &dense(&[1.0, 2.0]),
            &SparseSeries::new(vec![SparseRecord::new(ts(1), 5.0).with_tag("site", "b")]),
            secs(1),
            secs(0),
        );
        let other_match = CacheKey::for_inputs(&dense(&[1.0, 2.0]), &sparse(), secs(2), secs(0));
        let other_range = CacheKey::for_inputs(&dense(&[1.0, 2.0]), &sparse(), secs(1), secs(1));

        for other in [other_dense, other_sparse, other_match, other_range] {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn sqlite_round_trip_and_overwrite() {
        let dir = tempdir().unwrap();
        let cache = SqliteAlignmentCache::open(&dir.path().join("nested/cache.sqlite")).unwrap();
        let key = CacheKey::from_hex("abc");

        assert!(cache.get(&key).unwrap().is_none());
        cache.put(&key, &dataset()).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(dataset()));

        cache.put(&key, &AlignedDataset::empty(1)).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(AlignedDataset::empty(1)));
        assert_eq!(cache.entry_count().unwrap(), 1);
    }

    #[test]
    fn sqlite_persists_across_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");
        let key = CacheKey::from_hex("persist");
        SqliteAlignmentCache::open(&path)
            .unwrap()
            .put(&key, &dataset())
            .unwrap();

        let reopened = SqliteAlignmentCache::open(&path).unwrap();
        assert_eq!(reopened.get(&key).unwrap(), Some(dataset()));
    }

    #[test]
    fn non_finite_values_survive_storage() {
        let dir = tempdir().unwrap();
        let sqlite = SqliteAlignmentCache::open(&dir.path().join("cache.sqlite")).unwrap();
        let memory = InMemoryAlignmentCache::new();
        let key = CacheKey::from_hex("nan");
        let dataset = AlignedDataset {
            channel_count: 3,
            pairs: vec![AlignedPair {
                timestamp: ts(2),
                channels: vec![f64::NAN, f64::INFINITY, -0.0],
                ground_truth: f64::NEG_INFINITY,
                tag: Default::default(),
            }],
        };

        let caches: [&dyn AlignmentCache; 2] = [&sqlite, &memory];
        for cache in caches {
            cache.put(&key, &dataset).unwrap();
            let loaded = cache.get(&key).unwrap().unwrap();
            let pair = &loaded.pairs[0];
            assert!(pair.channels[0].is_nan());
            assert_eq!(pair.channels[1], f64::INFINITY);
            assert!(pair.channels[2] == 0.0 && pair.channels[2].is_sign_negative());
            assert_eq!(pair.ground_truth, f64::NEG_INFINITY);
            assert_eq!(pair.timestamp, ts(2));
        }
    }

    #[test]
    fn corrupt_payload_is_reported() {
        let cache = InMemoryAlignmentCache::new();
        let key = CacheKey::from_hex("bad");
        cache.put_raw(&key, "{not json");
        assert!(matches!(
            cache.get(&key).unwrap_err(),
            CacheError::Corrupt { .. }
        ));
    }
}
