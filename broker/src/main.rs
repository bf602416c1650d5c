use anyhow::Context;
use common::{logging::init_tracing, BrokerConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("broker=debug,tower_http=info,axum=info");

    let config = BrokerConfig::from_env();
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("no se pudo abrir {}", config.bind_addr))?;

    broker::serve_with_shutdown(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
