//! Pipeline configuration assembled from `RM_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::Duration as ChronoDuration;
use chrono_tz::Tz;
use thiserror::Error;

use crate::aggregation::{AggregationError, AggregationMode, ChannelSelection, GroupingRule};
use crate::alignment::AlignmentConfig;
use crate::loader::{DenseCsvConfig, SparseCsvConfig};

pub const DEFAULT_CACHE_PATH: &str = "data/alignment_cache.sqlite";
pub const DEFAULT_MODEL_PATH: &str = "data/model.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is required")]
    Missing { var: &'static str },
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub dense_path: Option<PathBuf>,
    pub sparse_path: Option<PathBuf>,
    pub alignment: AlignmentConfig,
    pub cache_path: PathBuf,
    pub dense: DenseCsvConfig,
    pub sparse: SparseCsvConfig,
    /// Raw channel list; resolved once the dense channel count is known.
    pub channels: Option<String>,
    pub grouping: GroupingRule,
    pub mode: AggregationMode,
    pub export_dir: Option<PathBuf>,
    pub model_path: PathBuf,
    pub server_addr: SocketAddr,
    pub ridge: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dense_path: None,
            sparse_path: None,
            alignment: AlignmentConfig::default(),
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            dense: DenseCsvConfig::default(),
            sparse: SparseCsvConfig::default(),
            channels: None,
            grouping: GroupingRule::Exact,
            mode: AggregationMode::Aggregate,
            export_dir: None,
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            ridge: 0.0,
        }
    }
}

impl PipelineConfig {
    pub fn require_dense_path(&self) -> Result<&PathBuf, ConfigError> {
        self.dense_path.as_ref().ok_or(ConfigError::Missing {
            var: "RM_DENSE_PATH",
        })
    }

    pub fn require_sparse_path(&self) -> Result<&PathBuf, ConfigError> {
        self.sparse_path.as_ref().ok_or(ConfigError::Missing {
            var: "RM_SPARSE_PATH",
        })
    }

    pub fn channel_selection(
        &self,
        channel_count: usize,
    ) -> Result<ChannelSelection, AggregationError> {
        ChannelSelection::parse(self.channels.as_deref(), channel_count)
    }
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig {
        dense_path: non_empty("RM_DENSE_PATH").map(PathBuf::from),
        sparse_path: non_empty("RM_SPARSE_PATH").map(PathBuf::from),
        // an explicitly empty RM_CHANNELS is kept so selection fails loudly
        channels: env::var("RM_CHANNELS").ok(),
        export_dir: non_empty("RM_EXPORT_DIR").map(PathBuf::from),
        ..PipelineConfig::default()
    };

    if let Some(raw) = non_empty("RM_MATCH_TOLERANCE_MS") {
        config.alignment.match_tolerance = parse_duration_ms("RM_MATCH_TOLERANCE_MS", &raw)?;
    }
    if let Some(raw) = non_empty("RM_RANGE_TOLERANCE_MS") {
        config.alignment.range_tolerance = parse_duration_ms("RM_RANGE_TOLERANCE_MS", &raw)?;
    }
    if let Some(raw) = non_empty("RM_CACHE_BYPASS") {
        config.alignment.cache_bypass = parse_bool(&raw)
            .ok_or_else(|| invalid("RM_CACHE_BYPASS", &raw, "expected a boolean"))?;
    }
    if let Some(raw) = non_empty("RM_CACHE_PATH") {
        config.cache_path = PathBuf::from(raw);
    }

    if let Some(raw) = non_empty("RM_GROUP_STEP") {
        let step = raw
            .parse::<f64>()
            .map_err(|err| invalid("RM_GROUP_STEP", &raw, &err.to_string()))?;
        if !step.is_finite() || step <= 0.0 {
            return Err(invalid("RM_GROUP_STEP", &raw, "must be finite and > 0"));
        }
        config.grouping = GroupingRule::Quantized { step };
    }
    if let Some(raw) = non_empty("RM_AGGREGATION_MODE") {
        config.mode = parse_mode(&raw).ok_or_else(|| {
            invalid("RM_AGGREGATION_MODE", &raw, "expected aggregate|individual")
        })?;
    }

    if let Some(raw) = non_empty("RM_VALUE_COLUMN") {
        config.sparse.value_column = raw;
    }
    if let Some(raw) = non_empty("RM_TIMESTAMP_COLUMN") {
        config.sparse.timestamp_column = raw;
    }
    if let Some(raw) = non_empty("RM_SPARSE_TZ") {
        config.sparse.timezone = raw
            .parse::<Tz>()
            .map_err(|err| invalid("RM_SPARSE_TZ", &raw, &err.to_string()))?;
    }
    if let Some(raw) = non_empty("RM_SPARSE_SKIP_ROWS") {
        config.sparse.skip_rows = raw
            .parse::<usize>()
            .map_err(|err| invalid("RM_SPARSE_SKIP_ROWS", &raw, &err.to_string()))?;
    }

    if let Some(raw) = non_empty("RM_MODEL_PATH") {
        config.model_path = PathBuf::from(raw);
    }
    if let Some(raw) = non_empty("RM_SERVER_ADDR") {
        config.server_addr = raw
            .parse::<SocketAddr>()
            .map_err(|err| invalid("RM_SERVER_ADDR", &raw, &err.to_string()))?;
    }
    if let Some(raw) = non_empty("RM_RIDGE") {
        let ridge = raw
            .parse::<f64>()
            .map_err(|err| invalid("RM_RIDGE", &raw, &err.to_string()))?;
        if !ridge.is_finite() || ridge < 0.0 {
            return Err(invalid("RM_RIDGE", &raw, "must be finite and >= 0"));
        }
        config.ridge = ridge;
    }

    Ok(config)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_duration_ms(var: &'static str, raw: &str) -> Result<ChronoDuration, ConfigError> {
    let ms = raw
        .trim()
        .parse::<i64>()
        .map_err(|err| invalid(var, raw, &err.to_string()))?;
    if ms < 0 {
        return Err(invalid(var, raw, "must be >= 0"));
    }
    Ok(ChronoDuration::milliseconds(ms))
}

fn parse_mode(raw: &str) -> Option<AggregationMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "aggregate" => Some(AggregationMode::Aggregate),
        "individual" => Some(AggregationMode::Individual),
        _ => None,
    }
}

pub(crate) fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alignment::DEFAULT_MATCH_TOLERANCE_MS;
    use std::sync::{Mutex, OnceLock};

    const ALL_VARS: [&str; 20] = [
        "RM_DENSE_PATH",
        "RM_SPARSE_PATH",
        "RM_MATCH_TOLERANCE_MS",
        "RM_RANGE_TOLERANCE_MS",
        "RM_CACHE_PATH",
        "RM_CACHE_BYPASS",
        "RM_CHANNELS",
        "RM_GROUP_STEP",
        "RM_AGGREGATION_MODE",
        "RM_VALUE_COLUMN",
        "RM_TIMESTAMP_COLUMN",
        "RM_SPARSE_TZ",
        "RM_SPARSE_SKIP_ROWS",
        "RM_EXPORT_DIR",
        "RM_MODEL_PATH",
        "RM_SERVER_ADDR",
        "RM_RIDGE",
        "RM_LOG_LEVEL",
        "RM_LOG_FORMAT",
        "RM_LOG_TARGET",
    ];

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    /// Runs `f` with every `RM_*` variable cleared except those in `vars`.
    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<(String, Option<String>)> = ALL_VARS
            .iter()
            .map(|key| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for key in ALL_VARS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&[], pipeline_config_from_env).unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(
            cfg.alignment.match_tolerance,
            ChronoDuration::milliseconds(DEFAULT_MATCH_TOLERANCE_MS)
        );
        assert_eq!(cfg.cache_path, PathBuf::from(DEFAULT_CACHE_PATH));
        assert!(cfg.require_dense_path().is_err());
    }

    #[test]
    fn parses_full_environment() {
        let cfg = with_env_vars(
            &[
                ("RM_DENSE_PATH", Some("radar.csv")),
                ("RM_SPARSE_PATH", Some("env.csv")),
                ("RM_MATCH_TOLERANCE_MS", Some("250")),
                ("RM_RANGE_TOLERANCE_MS", Some("5000")),
                ("RM_CACHE_BYPASS", Some("yes")),
                ("RM_CHANNELS", Some("1,3")),
                ("RM_GROUP_STEP", Some("0.5")),
                ("RM_AGGREGATION_MODE", Some("Individual")),
                ("RM_SPARSE_TZ", Some("America/Chicago")),
                ("RM_SPARSE_SKIP_ROWS", Some("1")),
                ("RM_SERVER_ADDR", Some("0.0.0.0:9000")),
                ("RM_RIDGE", Some("0.1")),
            ],
            pipeline_config_from_env,
        )
        .unwrap();

        assert_eq!(cfg.require_dense_path().unwrap(), &PathBuf::from("radar.csv"));
        assert_eq!(cfg.alignment.match_tolerance, ChronoDuration::milliseconds(250));
        assert_eq!(cfg.alignment.range_tolerance, ChronoDuration::seconds(5));
        assert!(cfg.alignment.cache_bypass);
        assert_eq!(cfg.grouping, GroupingRule::Quantized { step: 0.5 });
        assert_eq!(cfg.mode, AggregationMode::Individual);
        assert_eq!(cfg.sparse.timezone, chrono_tz::America::Chicago);
        assert_eq!(cfg.sparse.skip_rows, 1);
        assert_eq!(cfg.server_addr.port(), 9000);
        assert_eq!(
            cfg.channel_selection(4).unwrap(),
            ChannelSelection::Subset(vec![1, 3])
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (var, value) in [
            ("RM_MATCH_TOLERANCE_MS", "soon"),
            ("RM_RANGE_TOLERANCE_MS", "-5"),
            ("RM_CACHE_BYPASS", "maybe"),
            ("RM_GROUP_STEP", "0"),
            ("RM_AGGREGATION_MODE", "sum"),
            ("RM_SPARSE_TZ", "Mars/Olympus"),
            ("RM_SERVER_ADDR", "localhost"),
            ("RM_RIDGE", "-1"),
        ] {
            let err = with_env_vars(&[(var, Some(value))], pipeline_config_from_env).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { var: v, .. } if v == var),
                "{var}={value} gave {err:?}"
            );
        }
    }

    #[test]
    fn explicitly_empty_channel_list_fails_selection() {
        let cfg = with_env_vars(&[("RM_CHANNELS", Some(""))], pipeline_config_from_env).unwrap();
        assert!(matches!(
            cfg.channel_selection(3),
            Err(AggregationError::Configuration(_))
        ));
    }
}
