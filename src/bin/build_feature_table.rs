use ubp::{
    app_config_from_env, init_logging, log_app_finish, log_app_start, logging_config_from_env,
    run_pipeline,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = app_config_from_env()?;
    log_app_start(&logging_cfg, &cfg.input_path, &cfg.output_path);

    let table = run_pipeline(&cfg)?;
    log_app_finish(table.rows.len(), &table.schema.fingerprint);

    Ok(())
}
