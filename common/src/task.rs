use serde::{Deserialize, Serialize};

use crate::config::ShuffleConfig;
use crate::dag::{OpKind, PartitionerSpec, Persistence, StepArtifact};
use crate::error::{ErrorBody, FlowError, Result};
use crate::resource::Resource;
use crate::{DatasetId, FlowId, PartitionId, Record, StepId, TaskId};

/// Id determinista de la tarea que produce `partition` de `dataset`.
pub fn task_id(dataset: DatasetId, partition: PartitionId) -> TaskId {
    format!("d{dataset}-p{partition}")
}

/// Cómo llega un dataset a sus consumidores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Buffers acotados productor → consumidor, ambos vivos a la vez.
    Streamed,
    /// Archivos de partición que se leen cuando el productor ya terminó.
    Staged,
}

/// Filtro de ruteo de un shuffle: sólo pasan los registros cuyo
/// particionador apunta a `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub partitioner: PartitionerSpec,
    pub input_index: usize,
    pub target: PartitionId,
    pub target_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourcePartition {
    Inline { records: Vec<Record> },
    TextFile { path: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskWork {
    /// Materializa una partición de un dataset externo.
    Source { source: SourcePartition },
    /// Aplica un step (o cadena fusionada).
    Step {
        step: StepId,
        name: String,
        op: OpKind,
        logic: Vec<StepArtifact>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub input_index: usize,
    pub dataset: DatasetId,
    /// Particiones a leer, en orden.
    pub partitions: Vec<PartitionId>,
    pub delivery: Delivery,
    pub persistence: Persistence,
    pub route: Option<Route>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSpec {
    pub task: TaskId,
    pub route: Option<Route>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub delivery: Delivery,
    pub persistence: Persistence,
    /// Sólo para `Streamed`: un buffer por consumidor.
    pub consumers: Vec<ConsumerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub dataset: DatasetId,
    pub partition: PartitionId,
    pub partition_count: u32,
    pub work: TaskWork,
    pub inputs: Vec<TaskInput>,
    pub output: OutputSpec,
    pub resources: Resource,
}

impl TaskSpec {
    pub fn step_name(&self) -> &str {
        match &self.work {
            TaskWork::Source { .. } => "source",
            TaskWork::Step { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Pending → Running → {Succeeded, Failed}; Pending → Failed también vale
    /// (falla antes de arrancar).
    pub fn can_transition(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Failed)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
        )
    }

    pub fn advance(&mut self, next: TaskState) -> Result<()> {
        if !self.can_transition(next) {
            return Err(FlowError::Protocol(format!(
                "transición inválida {self:?} -> {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Dónde leer una partición de entrada concreta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    pub dataset: DatasetId,
    pub partition: PartitionId,
    /// Intento que produjo (o produce) la partición.
    pub attempt: u32,
    /// Agente que la sirve; `None` en ejecución local.
    pub agent_url: Option<String>,
}

/// Todo lo que un executor necesita para correr una tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub flow_id: FlowId,
    pub attempt: u32,
    pub spec: TaskSpec,
    pub bindings: Vec<InputBinding>,
    pub timeout_ms: u64,
    pub shuffle: ShuffleConfig,
}

impl TaskAssignment {
    pub fn binding(&self, dataset: DatasetId, partition: PartitionId) -> Option<&InputBinding> {
        self.bindings
            .iter()
            .find(|b| b.dataset == dataset && b.partition == partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub attempt: u32,
    pub state: TaskState,
    pub records_in: u64,
    pub records_out: u64,
    pub error: Option<ErrorBody>,
}
