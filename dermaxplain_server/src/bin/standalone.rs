use std::sync::Arc;

use dermaxplain::logging::init_logger;
use dermaxplain::{AppConfig, LocalExplainer, Oracle, PrototypeOracle, ScanPipeline};
use dermaxplain_server::{AppState, ServerConfig, start_server};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _guard = init_logger();

    let config = AppConfig::load()?;
    let oracle: Arc<dyn Oracle> = Arc::new(PrototypeOracle::from_config(&config.model));

    let pipeline = Arc::new(ScanPipeline::from_config(&config, oracle.clone())?);
    let explainer = Arc::new(LocalExplainer::from_config(oracle, &config));
    let state = AppState::new(pipeline.clone(), explainer);

    let handle = start_server(state, ServerConfig::from(&config.server)).await?;
    tokio::select! {
        _ = handle => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    // Let queued explanation jobs finish before exiting.
    pipeline.shutdown().await;
    Ok(())
}
