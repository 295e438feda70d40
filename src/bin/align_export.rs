use std::fs;
use std::io;

use radar_moisture::{
    aggregation_for, init_logging, log_app_start, logging_config_from_env,
    pipeline_config_from_env, run_alignment, write_aggregation_csv, write_aligned_pairs_csv,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env()?;
    init_logging(&logging_cfg)?;
    log_app_start("align_export", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    let run = run_alignment(&cfg)?;
    let output = aggregation_for(&cfg, &run.dataset)?;

    match &cfg.export_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let pairs_path = dir.join("aligned_pairs.csv");
            let view_path = dir.join(format!("{}_view.csv", cfg.mode.as_str()));
            write_aligned_pairs_csv(&run.dataset, fs::File::create(&pairs_path)?)?;
            write_aggregation_csv(&output, fs::File::create(&view_path)?)?;
            eprintln!(
                "aligned {} of {} records ({} dropped); wrote {} and {}",
                run.report.aligned,
                run.report.sparse_records,
                run.report.dropped(),
                pairs_path.display(),
                view_path.display()
            );
        }
        None => write_aggregation_csv(&output, io::stdout().lock())?,
    }

    Ok(())
}
