use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::Persistence;
use crate::error::ErrorBody;
use crate::resource::Resource;
use crate::task::{TaskReport, TaskState};
use crate::{AgentId, DatasetId, ExecutorId, FlowId, PartitionId, TaskId};

/* =========================
   Agente <-> broker
   ========================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterRequest {
    /// URL HTTP del agente, ej: "http://10.0.0.5:9100"
    pub address: String,
    /// host:puerto del plano de datos
    pub data_addr: String,
    pub hostname: String,
    pub resource: ResourceReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisterResponse {
    pub agent_id: AgentId,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: AgentId,
    pub resource: ResourceReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

/// Capacidad declarada y uso observado, enviado al registrar y en cada heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub capacity: Resource,
    pub free: Resource,
    pub running_executors: u32,
    pub observed_memory_mb: u64,
    pub cpu_percent: f32,
}

impl ResourceReport {
    pub fn idle(capacity: Resource) -> Self {
        Self {
            capacity,
            free: capacity,
            running_executors: 0,
            observed_memory_mb: 0,
            cpu_percent: 0.0,
        }
    }
}

/* =========================
   Driver <-> broker
   ========================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub resource: Resource,
    pub count: u32,
}

/// Una unidad de `resource` reservada en un agente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub agent_id: AgentId,
    pub address: String,
    pub data_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub allocations: Vec<Allocation>,
    pub resource: Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub agent_id: AgentId,
    pub resource: Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub ok: bool,
}

/// Vista de un agente para `GET /agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub address: String,
    pub data_addr: String,
    pub hostname: String,
    pub dead: bool,
    pub last_heartbeat_secs_ago: u64,
    pub capacity: Resource,
    pub reserved: Resource,
    pub free: Resource,
    pub running_executors: u32,
    pub observed_memory_mb: u64,
    pub cpu_percent: f32,
    pub registered_at: DateTime<Utc>,
}

/* =========================
   Driver <-> agente
   ========================= */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorHandle {
    pub executor_id: ExecutorId,
    pub agent_id: AgentId,
    pub agent_url: String,
    pub task_id: TaskId,
    pub attempt: u32,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub handle: ExecutorHandle,
    pub state: TaskState,
    pub report: Option<TaskReport>,
    pub error: Option<ErrorBody>,
}

/// Dónde se sirve una partición producida.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleDescriptor {
    pub flow_id: FlowId,
    pub dataset: DatasetId,
    pub partition: PartitionId,
    pub attempt: u32,
    pub executor_id: ExecutorId,
    pub data_addr: String,
    pub persistence: Persistence,
    /// `true` si la partición está en disco y puede leerse más de una vez.
    pub staged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub ok: bool,
    pub was_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseDatasetResponse {
    pub removed: bool,
}
