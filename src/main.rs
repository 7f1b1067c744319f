use std::io::Read;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use recurra::config::Config;
use recurra::engine::Engine;
use recurra::notify::NotifyHub;
use recurra::plan::{self, Plan};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the JSON schedule; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    if let Err(e) = recurra::observability::init(config.metrics_port) {
        tracing::warn!("metrics exporter disabled: {e}");
    }

    let input = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let plan: Plan = serde_json::from_str(&input)?;

    std::fs::create_dir_all(&config.data_dir)?;
    info!("recurra starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  generator limit: {} days", config.engine.default_generator_limit.num_days());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let engine = Engine::new(config.wal_path(), Arc::new(NotifyHub::new()), config.engine)?;
    let applied = plan::apply(&engine, &plan).await?;
    info!(events = applied.len(), "plan applied");

    engine.compact_if_needed(config.compact_threshold).await?;

    let schedule = plan::render(&engine).await?;
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &schedule)?;
    std::io::Write::write_all(&mut out, b"\n")?;
    Ok(())
}
