use common::{
    rpc::BrokerClient, AgentRegisterRequest, ErrorKind, FlowError, HeartbeatRequest,
};
use tracing::{debug, info, warn};

use crate::state::{lock, AgentState};

fn hostname() -> String {
    hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

/// Registro + heartbeat periódico contra el broker. Si el broker no conoce al
/// agente (reinicio del broker, desalojo), se vuelve a registrar.
pub async fn run_heartbeat_loop(state: AgentState) {
    let broker = BrokerClient::new(&state.config.broker_url);
    let interval = state.config.heartbeat_interval;

    loop {
        match state.agent_id() {
            None => match register(&state, &broker).await {
                Ok(id) => info!("agente registrado en {} como {}", broker.base_url(), id),
                Err(e) => warn!("registro en {} falló: {}", broker.base_url(), e),
            },
            Some(agent_id) => {
                let req = HeartbeatRequest {
                    agent_id: agent_id.clone(),
                    resource: state.resource_report(),
                };
                match broker.heartbeat(&req).await {
                    Ok(_) => debug!("heartbeat ok ({} executors)", req.resource.running_executors),
                    Err(e) if e.kind() == ErrorKind::UnknownAgent => {
                        warn!("el broker no conoce a {}; re-registrando", agent_id);
                        *lock(&state.identity) = None;
                        continue;
                    }
                    Err(e) => warn!("heartbeat falló: {}", e),
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn register(state: &AgentState, broker: &BrokerClient) -> Result<String, FlowError> {
    let resp = broker
        .register(&AgentRegisterRequest {
            address: state.url.clone(),
            data_addr: state.data_addr.clone(),
            hostname: hostname(),
            resource: state.resource_report(),
        })
        .await?;
    *lock(&state.identity) = Some(resp.agent_id.clone());
    Ok(resp.agent_id)
}
