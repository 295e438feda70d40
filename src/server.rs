//! HTTP prediction routes over a fitted [`LinearModel`].

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::regression::LinearModel;

pub const PREDICT_ROUTE: &str = "/v1/predict";
pub const MODEL_ROUTE: &str = "/v1/model";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    /// One feature row per prediction, in the model's channel order.
    pub data: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub predictions: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

pub fn model_router(model: Arc<LinearModel>) -> Router {
    Router::new()
        .route(PREDICT_ROUTE, post(post_predict))
        .route(MODEL_ROUTE, get(get_model))
        .with_state(ModelAppState { model })
}

#[derive(Clone)]
struct ModelAppState {
    model: Arc<LinearModel>,
}

async fn post_predict(
    State(state): State<ModelAppState>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let expected = state.model.feature_count();
    if request.data.is_empty() {
        return bad_request(format!(
            "Input must have shape (n, {expected}) with n >= 1"
        ));
    }
    if let Some((row, values)) = request
        .data
        .iter()
        .enumerate()
        .find(|(_, values)| values.len() != expected)
    {
        return bad_request(format!(
            "Input must have shape (n, {expected}); row {row} has {} values",
            values.len()
        ));
    }

    let mut predictions = Vec::with_capacity(request.data.len());
    for values in &request.data {
        match state.model.predict(values) {
            Ok(value) => predictions.push(value),
            Err(err) => return bad_request(err.to_string()),
        }
    }

    debug!(
        component = "server",
        event = "server.predict",
        rows = predictions.len()
    );
    Json(PredictResponse { predictions }).into_response()
}

async fn get_model(State(state): State<ModelAppState>) -> impl IntoResponse {
    Json(state.model.as_ref().clone())
}

fn bad_request(detail: String) -> Response {
    warn!(
        component = "server",
        event = "server.predict.rejected",
        detail = %detail
    );
    (StatusCode::BAD_REQUEST, Json(ErrorBody { detail })).into_response()
}
