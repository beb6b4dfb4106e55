use agent_runtime::{api::ApiServer, config::RuntimeConfig, runtime::AgentRuntime};
use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting agent runtime");

    let config = RuntimeConfig::load()?;
    let runtime = AgentRuntime::start(config).await?;
    runtime.seed_default_agent().await?;

    let api_server = ApiServer::new(
        runtime.config.api.clone(),
        runtime.service.clone(),
        runtime.manager.clone(),
    );

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("API server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    runtime.shutdown().await;
    Ok(())
}
