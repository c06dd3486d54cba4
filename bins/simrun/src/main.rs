use anyhow::Context;
use sim_config::config::SimConfig;
use sim_runner::WorkloadRunner;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO")))
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "data/sim.yaml".to_string());
    let config = SimConfig::load(&config_path).with_context(|| format!("loading config '{config_path}'"))?;

    let index_name = config.index.kind.to_string();
    let out_dir = config.metrics.out_dir.clone();
    info!(index = %index_name, config = %config_path, "starting simulation run");

    let runner = WorkloadRunner::new(config);
    let reports = runner.run_all(&index_name)?;

    for r in &reports {
        info!(
            workload = %r.workload,
            ops = r.ops,
            p50_us = r.p50_us,
            p95_us = r.p95_us,
            p99_us = r.p99_us,
            "workload complete"
        );
    }

    info!(out_dir = %out_dir, "done, check out_dir for CSV outputs");
    Ok(())
}
