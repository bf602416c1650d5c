//! Agente de nodo: ofrece la capacidad de la máquina al broker, lanza un
//! proceso executor por tarea y sirve las particiones persistidas en disco.

pub mod executor;
pub mod gc;
pub mod handlers;
pub mod heartbeat;
pub mod launcher;
pub mod locations;
pub mod remote;
pub mod state;
pub mod supervisor;
pub mod usage;

use anyhow::Context;
use common::{
    shuffle::{DataServer, ExchangeHub},
    AgentConfig, ShuffleConfig,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::{info, warn};

pub use launcher::{ExecutorLauncher, ProcessLauncher};
pub use state::AgentState;

/// Agente ya escuchando; las tareas de fondo quedan corriendo en el runtime
/// hasta `shutdown`.
pub struct AgentServer {
    pub url: String,
    pub data_addr: String,
    pub state: AgentState,
    stop_http: watch::Sender<bool>,
    http: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl AgentServer {
    /// Apaga el agente: detiene sus executors, deja de dar heartbeats y
    /// cierra ambos planos. El broker lo da por muerto al vencer el timeout
    /// de heartbeat.
    pub async fn shutdown(self) {
        let stopped = supervisor::stop_all(&self.state);
        for task in &self.background {
            task.abort();
        }
        let _ = self.stop_http.send(true);
        if tokio::time::timeout(Duration::from_secs(5), self.http).await.is_err() {
            warn!("el servidor HTTP de {} no cerró a tiempo", self.url);
        }
        info!("agente {} detenido ({} executors cortados)", self.url, stopped);
    }
}

/// Host anunciado: el de `config.url` si existe; si no, el de la dirección
/// real salvo que sea 0.0.0.0.
fn advertised_host(config: &AgentConfig, bound: &SocketAddr) -> String {
    if let Some(host) = config
        .url
        .as_deref()
        .and_then(|u| reqwest::Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_string))
    {
        return host;
    }
    if bound.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        bound.ip().to_string()
    }
}

pub async fn start(
    config: AgentConfig,
    launcher: Arc<dyn ExecutorLauncher>,
) -> anyhow::Result<AgentServer> {
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("no se pudo crear {}", config.storage_dir.display()))?;

    let http = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("no se pudo abrir {}", config.bind_addr))?;
    let data = TcpListener::bind(&config.data_bind_addr)
        .await
        .with_context(|| format!("no se pudo abrir {}", config.data_bind_addr))?;

    let http_addr = http.local_addr()?;
    let host = advertised_host(&config, &http_addr);
    let url = config
        .url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", host, http_addr.port()));
    let data_addr = format!("{}:{}", host, data.local_addr()?.port());

    // los datasets persistidos se leen directo del storage del agente
    let server = Arc::new(DataServer::new(
        Arc::new(ExchangeHub::new()),
        config.storage_dir.clone(),
        ShuffleConfig::default().attach_timeout(),
    ));
    let data_plane = tokio::spawn(server.serve(data));

    let state = AgentState::new(config, url.clone(), data_addr.clone(), host, launcher);

    let (stop_http, mut stop_rx) = watch::channel(false);
    let app = handlers::build_router(state.clone());
    let http_task = tokio::spawn(async move {
        // soltar el AgentServer sin `shutdown` deja el servidor corriendo
        let stopped = async move {
            if stop_rx.wait_for(|v| *v).await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        if let Err(e) = axum::serve(http, app).with_graceful_shutdown(stopped).await {
            warn!("servidor HTTP del agente terminó: {}", e);
        }
    });

    let background = vec![
        data_plane,
        tokio::spawn(heartbeat::run_heartbeat_loop(state.clone())),
        tokio::spawn(gc::run_gc_loop(state.clone())),
    ];

    info!("agente escuchando en {} (datos en {})", url, data_addr);
    Ok(AgentServer {
        url,
        data_addr,
        state,
        stop_http,
        http: http_task,
        background,
    })
}
