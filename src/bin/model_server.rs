use std::sync::Arc;

use radar_moisture::{
    init_logging, log_app_bind, log_app_start, logging_config_from_env, model_router,
    pipeline_config_from_env, LinearModel, MODEL_ROUTE, PREDICT_ROUTE,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env()?;
    init_logging(&logging_cfg)?;
    log_app_start("model_server", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    let model = Arc::new(LinearModel::load_json(&cfg.model_path)?);

    let app = model_router(model);
    let listener = tokio::net::TcpListener::bind(cfg.server_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind("model_server", bound_addr, &[PREDICT_ROUTE, MODEL_ROUTE]);
    axum::serve(listener, app).await?;

    Ok(())
}
