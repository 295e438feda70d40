use radar_moisture::{
    fit_linear_model, init_logging, log_app_start, logging_config_from_env,
    pipeline_config_from_env, run_alignment,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env()?;
    init_logging(&logging_cfg)?;
    log_app_start("fit_model", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    let run = run_alignment(&cfg)?;
    let selection = cfg.channel_selection(run.dataset.channel_count)?;
    let model = fit_linear_model(&run.dataset, &selection, cfg.ridge)?;
    model.save_json(&cfg.model_path)?;

    println!(
        "fitted {} features on {} pairs (r^2={:.4}, intercept={:.6}); saved {}",
        model.feature_count(),
        model.training_pairs,
        model.r_squared,
        model.intercept,
        cfg.model_path.display()
    );

    Ok(())
}
