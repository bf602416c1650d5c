use common::{logging::init_tracing, AgentConfig};
use std::sync::Arc;
use tracing::info;

use agent::ProcessLauncher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("agent=debug,common=info,tower_http=info");

    let config = AgentConfig::from_env();
    let launcher = Arc::new(ProcessLauncher::new(config.executor_bin.clone()));
    let server = agent::start(config, launcher).await?;

    tokio::signal::ctrl_c().await?;
    info!("agente {} terminando", server.url);
    server.shutdown().await;
    Ok(())
}
