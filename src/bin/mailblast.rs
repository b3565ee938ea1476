use mailblast::{Engine, EngineConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;
    info!(db = %config.database_path.display(), "starting mailblast engine");

    let engine = Engine::new(config).await?;

    let interrupted = engine.interrupted_campaigns().await?;
    if !interrupted.is_empty() {
        warn!(
            count = interrupted.len(),
            "campaigns were interrupted by a previous shutdown; see send logs to reconcile"
        );
    }

    let scheduler = engine.start_scheduler();
    info!("scheduler running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    scheduler.shutdown();
    info!("engine stopped");

    Ok(())
}
