//! Load, align and summarize in one call, as the batch binaries do.

use thiserror::Error;
use tracing::{info, warn};

use crate::aggregation::{aggregation_view, AggregationError, AggregationOutput};
use crate::alignment::{
    align_cached, AlignError, AlignedDataset, AlignmentReport, TracingObserver,
};
use crate::cache::{AlignmentCache, InMemoryAlignmentCache, SqliteAlignmentCache};
use crate::config::{ConfigError, PipelineConfig};
use crate::export::ExportError;
use crate::loader::{load_dense_csv, load_sparse_csv, LoadError};
use crate::regression::ModelError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Align(#[from] AlignError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub dataset: AlignedDataset,
    pub report: AlignmentReport,
}

/// Loads both series from the configured paths and aligns them through the
/// SQLite cache. A cache that cannot be opened degrades to an in-memory one.
pub fn run_alignment(cfg: &PipelineConfig) -> Result<PipelineRun, PipelineError> {
    let dense = load_dense_csv(cfg.require_dense_path()?, &cfg.dense)?;
    let sparse = load_sparse_csv(cfg.require_sparse_path()?, &cfg.sparse)?;

    let cache: Box<dyn AlignmentCache> = match SqliteAlignmentCache::open(&cfg.cache_path) {
        Ok(cache) => Box::new(cache),
        Err(err) => {
            warn!(
                component = "pipeline",
                event = "cache.open_failed",
                path = %cfg.cache_path.display(),
                error = %err
            );
            Box::new(InMemoryAlignmentCache::new())
        }
    };

    let (dataset, report) = align_cached(
        &dense,
        &sparse,
        &cfg.alignment,
        cache.as_ref(),
        &mut TracingObserver,
    )?;

    info!(
        component = "pipeline",
        event = "pipeline.aligned",
        aligned = report.aligned,
        dropped = report.dropped(),
        cache = ?report.cache
    );

    Ok(PipelineRun { dataset, report })
}

/// Builds the configured aggregation view over an aligned dataset.
pub fn aggregation_for(
    cfg: &PipelineConfig,
    dataset: &AlignedDataset,
) -> Result<AggregationOutput, PipelineError> {
    let selection = cfg.channel_selection(dataset.channel_count)?;
    Ok(aggregation_view(dataset, cfg.mode, &selection, cfg.grouping)?)
}
