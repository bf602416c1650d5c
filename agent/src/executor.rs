//! Entrada del proceso `flow-executor`.

use common::{
    run_task,
    shuffle::{DataServer, ExchangeHub},
    FlowError, Result, StepRegistry, TaskAssignment, TaskReport, TaskState,
};
use std::{env, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::info;

use crate::launcher::{ERROR_PREFIX, REPORT_PREFIX};
use crate::remote::RemoteTransport;

/// Configuración que el agente le pasa al executor por entorno.
#[derive(Debug, Clone)]
pub struct ExecutorEnv {
    pub assignment_path: PathBuf,
    pub executor_id: String,
    pub agent_url: String,
    pub agent_data_addr: String,
    pub data_host: String,
    pub storage_dir: PathBuf,
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| FlowError::InvalidConfig(format!("falta la variable {name}")))
}

impl ExecutorEnv {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            assignment_path: PathBuf::from(required("FLOW_ASSIGNMENT")?),
            executor_id: required("FLOW_EXECUTOR_ID")?,
            agent_url: required("FLOW_AGENT_URL")?,
            agent_data_addr: required("FLOW_AGENT_DATA_ADDR")?,
            data_host: env::var("FLOW_DATA_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            storage_dir: PathBuf::from(required("FLOW_STORAGE_DIR")?),
        })
    }
}

/// Corre la tarea asignada. Abre un plano de datos propio para servir las
/// salidas en streaming mientras dura la tarea.
pub async fn run(env: ExecutorEnv, registry: StepRegistry) -> Result<TaskReport> {
    let raw = tokio::fs::read(&env.assignment_path).await?;
    let assignment: TaskAssignment = serde_json::from_slice(&raw)?;

    let listener = TcpListener::bind((env.data_host.as_str(), 0)).await?;
    let own_data_addr = listener.local_addr()?.to_string();

    let hub = Arc::new(ExchangeHub::new());
    let server = Arc::new(DataServer::new(
        hub.clone(),
        env.storage_dir.clone(),
        assignment.shuffle.attach_timeout(),
    ));
    let serving = tokio::spawn(server.serve(listener));

    info!(
        "executor {} corriendo {} (plano de datos en {})",
        env.executor_id, assignment.spec.id, own_data_addr
    );

    let transport = RemoteTransport::new(
        hub,
        env.storage_dir.clone(),
        env.executor_id.clone(),
        env.agent_url.clone(),
        env.agent_data_addr.clone(),
        own_data_addr,
    );
    let report = run_task(&assignment, &registry, &transport).await;
    serving.abort();
    Ok(report)
}

/// Imprime el reporte en stdout (y el error en stderr) con los prefijos que
/// el agente reconoce. Devuelve el código de salida.
pub fn emit(report: &Result<TaskReport>) -> i32 {
    match report {
        Ok(r) => {
            if let Ok(json) = serde_json::to_string(r) {
                println!("{REPORT_PREFIX}{json}");
            }
            if let Some(err) = &r.error {
                if let Ok(json) = serde_json::to_string(err) {
                    eprintln!("{ERROR_PREFIX}{json}");
                }
            }
            if r.state == TaskState::Succeeded {
                0
            } else {
                1
            }
        }
        Err(e) => {
            if let Ok(json) = serde_json::to_string(&e.to_body()) {
                eprintln!("{ERROR_PREFIX}{json}");
            }
            2
        }
    }
}
