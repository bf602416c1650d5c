//! Clientes HTTP del broker y de los agentes.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::agent::{
    AgentInfo, AgentRegisterRequest, AgentRegisterResponse, AllocationRequest, AllocationResponse,
    ExecutorHandle, ExecutorStatus, HeartbeatRequest, HeartbeatResponse, ReleaseDatasetResponse,
    ReleaseRequest, ReleaseResponse, ResourceReport, ShuffleDescriptor, StopResponse,
};
use crate::error::{ErrorBody, FlowError, Result};
use crate::task::TaskAssignment;
use crate::{DatasetId, PartitionId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn unreachable(url: &str, e: reqwest::Error) -> FlowError {
    FlowError::AgentUnreachable(format!("{url}: {e}"))
}

/// Respuesta exitosa → `T`; si no, el `ErrorBody` del servidor.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| FlowError::Protocol(format!("respuesta inválida: {e}")));
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => Err(body.into()),
        Err(_) => Err(FlowError::Protocol(format!("status inesperado {status}"))),
    }
}

/* =========================
   Broker
   ========================= */

#[derive(Debug, Clone)]
pub struct BrokerClient {
    base_url: String,
    http: Client,
}

impl BrokerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: http_client(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, req: &AgentRegisterRequest) -> Result<AgentRegisterResponse> {
        let url = format!("{}/api/v1/agents/register", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let url = format!("{}/api/v1/agents/heartbeat", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        let url = format!("{}/api/v1/agents", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }

    pub async fn agent(&self, agent_id: &str) -> Result<AgentInfo> {
        let url = format!("{}/api/v1/agents/{agent_id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }

    pub async fn request_allocation(&self, req: &AllocationRequest) -> Result<AllocationResponse> {
        let url = format!("{}/api/v1/allocations", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }

    pub async fn release(&self, req: &ReleaseRequest) -> Result<()> {
        let url = format!("{}/api/v1/allocations/release", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode::<ReleaseResponse>(resp).await.map(|_| ())
    }
}

/* =========================
   Agente
   ========================= */

#[derive(Debug, Clone)]
pub struct AgentClient {
    http: Client,
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentClient {
    pub fn new() -> Self {
        Self {
            http: http_client(),
        }
    }

    fn url(agent: &str, path: &str) -> String {
        format!("{}{}", agent.trim_end_matches('/'), path)
    }

    pub async fn start_executor(
        &self,
        agent: &str,
        assignment: &TaskAssignment,
    ) -> Result<ExecutorHandle> {
        let url = Self::url(agent, "/api/v1/executors");
        let resp = self
            .http
            .post(&url)
            .json(assignment)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }

    pub async fn executor_status(&self, agent: &str, executor_id: &str) -> Result<ExecutorStatus> {
        let url = Self::url(agent, &format!("/api/v1/executors/{executor_id}"));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }

    pub async fn stop_executor(&self, agent: &str, executor_id: &str) -> Result<StopResponse> {
        let url = Self::url(agent, &format!("/api/v1/executors/{executor_id}/stop"));
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }

    pub async fn report_location(&self, agent: &str, desc: &ShuffleDescriptor) -> Result<()> {
        let url = Self::url(agent, "/api/v1/datasets/locations");
        let resp = self
            .http
            .post(&url)
            .json(desc)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode::<serde_json::Value>(resp).await.map(|_| ())
    }

    /// `None` si el agente no conoce esa partición.
    pub async fn lookup_location(
        &self,
        agent: &str,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
    ) -> Result<Option<ShuffleDescriptor>> {
        let url = Self::url(
            agent,
            &format!("/api/v1/datasets/{flow_id}/{dataset}/{partition}"),
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(resp).await.map(Some)
    }

    /// Detiene los executors del flow y borra sus datos.
    pub async fn cancel_flow(&self, agent: &str, flow_id: &str) -> Result<()> {
        let url = Self::url(agent, &format!("/api/v1/flows/{flow_id}/cancel"));
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode::<serde_json::Value>(resp).await.map(|_| ())
    }

    pub async fn release_dataset(
        &self,
        agent: &str,
        flow_id: &str,
        dataset: DatasetId,
    ) -> Result<bool> {
        let url = Self::url(
            agent,
            &format!("/api/v1/flows/{flow_id}/datasets/{dataset}/release"),
        );
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode::<ReleaseDatasetResponse>(resp).await.map(|r| r.removed)
    }

    pub async fn resources(&self, agent: &str) -> Result<ResourceReport> {
        let url = Self::url(agent, "/api/v1/resources");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, e))?;
        decode(resp).await
    }
}
