use common::{
    AgentConfig, AgentId, ErrorBody, ExecutorHandle, ExecutorId, FlowId, Resource,
    ResourceReport, ResourceUsage, TaskReport, TaskState,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};
use tokio::sync::oneshot;

use crate::launcher::ExecutorLauncher;
use crate::locations::LocationTable;
use crate::usage::UsageSampler;

/// Lock que sobrevive a un mutex envenenado.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
pub struct ExecutorRecord {
    pub handle: ExecutorHandle,
    pub flow_id: FlowId,
    pub resources: Resource,
    pub state: TaskState,
    pub report: Option<TaskReport>,
    pub error: Option<ErrorBody>,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub(crate) stop: Option<oneshot::Sender<()>>,
}

impl ExecutorRecord {
    pub fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[derive(Clone)]
pub struct AgentState {
    pub config: Arc<AgentConfig>,
    /// URL HTTP anunciada al broker y a los executors.
    pub url: String,
    /// host:puerto del plano de datos del agente.
    pub data_addr: String,
    /// Host donde los executors abren su plano de datos.
    pub data_host: String,
    pub resources: Arc<Mutex<ResourceUsage>>,
    pub executors: Arc<Mutex<HashMap<ExecutorId, ExecutorRecord>>>,
    pub locations: Arc<Mutex<LocationTable>>,
    /// Id asignado por el broker; `None` mientras no esté registrado.
    pub identity: Arc<Mutex<Option<AgentId>>>,
    pub launcher: Arc<dyn ExecutorLauncher>,
    pub usage: Arc<Mutex<UsageSampler>>,
}

impl AgentState {
    pub fn new(
        config: AgentConfig,
        url: String,
        data_addr: String,
        data_host: String,
        launcher: Arc<dyn ExecutorLauncher>,
    ) -> Self {
        let capacity = config.capacity;
        Self {
            config: Arc::new(config),
            url,
            data_addr,
            data_host,
            resources: Arc::new(Mutex::new(ResourceUsage::new(capacity))),
            executors: Arc::new(Mutex::new(HashMap::new())),
            locations: Arc::new(Mutex::new(LocationTable::default())),
            identity: Arc::new(Mutex::new(None)),
            launcher,
            usage: Arc::new(Mutex::new(UsageSampler::new())),
        }
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        lock(&self.identity).clone()
    }

    pub fn running_pids(&self) -> Vec<u32> {
        lock(&self.executors)
            .values()
            .filter(|r| r.is_running())
            .filter_map(|r| r.handle.pid)
            .collect()
    }

    pub fn running_count(&self) -> u32 {
        lock(&self.executors)
            .values()
            .filter(|r| r.is_running())
            .count() as u32
    }

    pub fn has_running_for_flow(&self, flow_id: &str) -> bool {
        lock(&self.executors)
            .values()
            .any(|r| r.is_running() && r.flow_id == flow_id)
    }

    /// Capacidad declarada, libre según reservas locales, y uso observado
    /// de los procesos executor.
    pub fn resource_report(&self) -> ResourceReport {
        let (capacity, free) = {
            let res = lock(&self.resources);
            (res.capacity, res.free())
        };
        let pids = self.running_pids();
        let (observed_memory_mb, cpu_percent) = lock(&self.usage).sample(&pids);

        ResourceReport {
            capacity,
            free,
            running_executors: pids.len() as u32,
            observed_memory_mb,
            cpu_percent,
        }
    }
}
