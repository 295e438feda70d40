//! Linear regression of ground truth on selected channel means.

use std::fs;
use std::io::Write;
use std::path::Path;

use nalgebra::{Cholesky, DMatrix, DVector, SVD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::aggregation::{AggregationError, ChannelSelection};
use crate::alignment::AlignedDataset;

const SVD_MAX_ITERATIONS: usize = 1_000;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("cannot fit a model on an empty dataset")]
    EmptyDataset,
    #[error(transparent)]
    Selection(#[from] AggregationError),
    #[error("least squares system could not be solved; check for non-finite samples")]
    Singular,
    #[error("expected {expected} features, found {found}")]
    FeatureWidth { expected: usize, found: usize },
    #[error("invalid ridge penalty {0}")]
    InvalidRidge(f64),
    #[error("invalid model path: {0}")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    /// 1-based source channels, one per coefficient.
    pub channels: Vec<usize>,
    /// Channel count of the dataset the model was fitted on.
    pub source_channel_count: usize,
    pub training_pairs: usize,
    pub ridge: f64,
    pub r_squared: f64,
}

impl LinearModel {
    pub fn feature_count(&self) -> usize {
        self.coefficients.len()
    }

    /// Predicts from a feature row laid out in `channels` order.
    pub fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        if features.len() != self.feature_count() {
            return Err(ModelError::FeatureWidth {
                expected: self.feature_count(),
                found: features.len(),
            });
        }
        Ok(self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(coef, x)| coef * x)
                .sum::<f64>())
    }

    /// Picks this model's features out of a full channel row.
    pub fn features_from_channels(&self, channels: &[f64]) -> Result<Vec<f64>, ModelError> {
        select_features(channels, &self.channels, self.source_channel_count)
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        info!(
            component = "regression",
            event = "model.saved",
            path = %path.display(),
            features = self.feature_count()
        );
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self, ModelError> {
        let bytes = fs::read(path)?;
        let model: Self = serde_json::from_slice(&bytes)?;
        if model.channels.len() != model.coefficients.len() {
            return Err(ModelError::FeatureWidth {
                expected: model.coefficients.len(),
                found: model.channels.len(),
            });
        }
        Ok(model)
    }
}

/// Fits `ground_truth ~ intercept + channels` by least squares.
///
/// Features are centred first so the intercept is never penalized. With
/// `ridge == 0` the minimum-norm solution is returned, which keeps fits with
/// fewer pairs than features (or collinear channels) well defined. A positive
/// `ridge` solves the penalized normal equations by Cholesky.
pub fn fit_linear_model(
    dataset: &AlignedDataset,
    selection: &ChannelSelection,
    ridge: f64,
) -> Result<LinearModel, ModelError> {
    if !ridge.is_finite() || ridge < 0.0 {
        return Err(ModelError::InvalidRidge(ridge));
    }
    if dataset.is_empty() {
        return Err(ModelError::EmptyDataset);
    }
    if let ChannelSelection::Subset(indices) = selection {
        ChannelSelection::from_indices(indices.clone(), dataset.channel_count)?;
    }

    let channels: Vec<usize> = selection
        .zero_based(dataset.channel_count)
        .into_iter()
        .map(|idx| idx + 1)
        .collect();
    let rows = dataset
        .pairs
        .iter()
        .map(|pair| select_features(&pair.channels, &channels, dataset.channel_count))
        .collect::<Result<Vec<_>, _>>()?;
    let targets = dataset.ground_truth();

    let n = rows.len();
    let p = channels.len();
    let x_mean = DVector::from_fn(p, |j, _| {
        rows.iter().map(|row| row[j]).sum::<f64>() / n as f64
    });
    let y_mean = targets.iter().sum::<f64>() / n as f64;

    let design = DMatrix::from_fn(n, p, |i, j| rows[i][j] - x_mean[j]);
    let response = DVector::from_fn(n, |i, _| targets[i] - y_mean);

    let solution = if p == 0 {
        DVector::zeros(0)
    } else if ridge > 0.0 {
        solve_ridge(&design, &response, ridge)?
    } else {
        solve_min_norm(design, &response)?
    };
    let intercept = y_mean - solution.dot(&x_mean);
    let coefficients: Vec<f64> = solution.iter().copied().collect();

    let mut model = LinearModel {
        intercept,
        coefficients,
        channels,
        source_channel_count: dataset.channel_count,
        training_pairs: rows.len(),
        ridge,
        r_squared: 0.0,
    };
    model.r_squared = r_squared(&model, &rows, &targets, y_mean)?;

    info!(
        component = "regression",
        event = "model.fit.finish",
        pairs = model.training_pairs,
        features = model.feature_count(),
        ridge,
        r_squared = model.r_squared
    );

    Ok(model)
}

fn select_features(
    channels: &[f64],
    selected: &[usize],
    channel_count: usize,
) -> Result<Vec<f64>, ModelError> {
    if channels.len() != channel_count {
        return Err(ModelError::FeatureWidth {
            expected: channel_count,
            found: channels.len(),
        });
    }
    selected
        .iter()
        .map(|channel| {
            channel
                .checked_sub(1)
                .and_then(|idx| channels.get(idx))
                .copied()
                .ok_or(ModelError::FeatureWidth {
                    expected: *channel,
                    found: channels.len(),
                })
        })
        .collect()
}

fn r_squared(
    model: &LinearModel,
    rows: &[Vec<f64>],
    targets: &[f64],
    y_mean: f64,
) -> Result<f64, ModelError> {
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (row, y) in rows.iter().zip(targets) {
        let residual = y - model.predict(row)?;
        ss_res += residual * residual;
        ss_tot += (y - y_mean) * (y - y_mean);
    }
    if ss_tot == 0.0 {
        return Ok(if ss_res == 0.0 { 1.0 } else { 0.0 });
    }
    Ok(1.0 - ss_res / ss_tot)
}

fn solve_ridge(
    design: &DMatrix<f64>,
    response: &DVector<f64>,
    ridge: f64,
) -> Result<DVector<f64>, ModelError> {
    let p = design.ncols();
    let gram = design.tr_mul(design) + DMatrix::<f64>::identity(p, p) * ridge;
    let rhs = design.tr_mul(response);
    let chol = Cholesky::new(gram).ok_or(ModelError::Singular)?;
    Ok(chol.solve(&rhs))
}

/// Minimum-norm least squares through the SVD. Singular values below the
/// usual `max(n, p) * eps * s_max` cutoff are treated as zero.
fn solve_min_norm(
    design: DMatrix<f64>,
    response: &DVector<f64>,
) -> Result<DVector<f64>, ModelError> {
    let (n, p) = design.shape();
    let svd = SVD::try_new(design, true, true, f64::EPSILON, SVD_MAX_ITERATIONS)
        .ok_or(ModelError::Singular)?;
    let cutoff = svd.singular_values.max() * n.max(p) as f64 * f64::EPSILON;
    if !cutoff.is_finite() {
        return Err(ModelError::Singular);
    }
    svd.solve(response, cutoff).map_err(|_| ModelError::Singular)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ModelError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ModelError::InvalidPath(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
