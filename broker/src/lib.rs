pub mod handlers;
pub mod monitor;
pub mod state;

use common::BrokerConfig;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::info;

pub use state::{AppState, Registry};

/// Corre el broker sobre un listener ya abierto (el monitor de liveness va
/// en segundo plano). No retorna salvo error del servidor.
pub async fn serve(listener: TcpListener, config: BrokerConfig) -> anyhow::Result<()> {
    serve_with_shutdown(listener, config, std::future::pending()).await
}

/// Como `serve`, pero termina cuando se completa `signal`: deja de aceptar,
/// cierra las conexiones ociosas y detiene el monitor. El registro de
/// agentes se pierde; cada agente se vuelve a registrar en su próximo
/// heartbeat contra el broker nuevo.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    config: BrokerConfig,
    signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(config);

    let monitor_state = state.clone();
    let monitor = tokio::spawn(async move {
        monitor::monitor_agents(monitor_state).await;
    });

    let app = handlers::build_router(state);
    info!("broker escuchando en {}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await;
    monitor.abort();
    info!("broker detenido");
    served?;
    Ok(())
}
