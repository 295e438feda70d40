//! Radar / leaf-moisture alignment core crate.
//!
//! Current implemented scope:
//! - dense and sparse series models with CSV loaders
//! - overlap detection and tolerance-bounded nearest-sample joins
//! - fingerprint-keyed alignment cache (SQLite and in-memory)
//! - ground-truth grouping with aggregate and per-channel views
//! - linear moisture model fitting and an HTTP prediction service

mod aggregation;
mod alignment;
mod cache;
mod config;
mod export;
mod loader;
mod nearest;
mod observability;
mod pipeline;
mod range;
mod regression;
mod series;
mod server;

pub use aggregation::{
    aggregate_series, aggregation_view, group_by_ground_truth, individual_series,
    validate_grouping_rule, AggregationError, AggregationMode, AggregationOutput,
    ChannelLine, ChannelSelection, GroupedAggregate, GroupingRule, SeriesLine,
};
pub use alignment::{
    align, align_cached, AlignError, AlignedDataset, AlignedPair, AlignmentConfig,
    AlignmentObserver, AlignmentReport, CacheStatus, NoopObserver, SkipReason, TracingObserver,
    DEFAULT_MATCH_TOLERANCE_MS,
};
pub use cache::{
    AlignmentCache, CacheError, CacheKey, InMemoryAlignmentCache, SqliteAlignmentCache,
    CACHE_SCHEMA_VERSION,
};
pub use config::{
    parse_bool, pipeline_config_from_env, ConfigError, PipelineConfig, DEFAULT_CACHE_PATH,
    DEFAULT_MODEL_PATH,
};
pub use export::{write_aggregation_csv, write_aligned_pairs_csv, ExportError};
pub use loader::{
    epoch_to_timestamp, load_dense_csv, load_sparse_csv, parse_timestamp, DenseCsvConfig,
    LoadError, SparseCsvConfig,
};
pub use nearest::{nearest_within, NearestMatch};
pub use observability::{
    init_logging, log_app_bind, log_app_start, logging_config_from_env, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use pipeline::{aggregation_for, run_alignment, PipelineError, PipelineRun};
pub use range::{intersect, range_of_dense, range_of_sparse, RangeError, SeriesKind, TimeRange};
pub use regression::{fit_linear_model, LinearModel, ModelError};
pub use series::{DenseSample, DenseSeries, SeriesError, SparseRecord, SparseSeries, Timestamp};
pub use server::{
    model_router, ErrorBody, PredictRequest, PredictResponse, MODEL_ROUTE, PREDICT_ROUTE,
};
