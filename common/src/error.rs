use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::Resource;
use crate::{AgentId, DatasetId, ExecutorId, PartitionId, StepId, TaskId};

/// Clasificación serializable de errores, la que viaja por HTTP y en los
/// reportes de tareas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    CycleDetected,
    UnresolvedPartitioner,
    InvalidGraph,
    InsufficientResource,
    ResourceUnavailable,
    UnknownAgent,
    UnknownExecutor,
    AgentUnreachable,
    TaskFailure,
    ShuffleTransport,
    StepLogic,
    NotFound,
    Cancelled,
    Protocol,
    InvalidConfig,
    Io,
}

/// Taxonomía de errores del motor.
///
/// - errores de grafo (`CycleDetected`, `UnresolvedPartitioner`, `InvalidGraph`):
///   se detectan al compilar, el flujo nunca se agenda
/// - errores de capacidad (`InsufficientResource`, `ResourceUnavailable`)
/// - errores de ejecución (`TaskFailure`, `StepLogic`, `ShuffleTransport`)
/// - `Remote`: error reconstruido a partir de un `ErrorBody` recibido por red
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("ciclo detectado en el grafo (dataset {dataset})")]
    CycleDetected { dataset: DatasetId },

    #[error("el step {step} reparticiona el dataset {dataset} pero no tiene particionador")]
    UnresolvedPartitioner { step: StepId, dataset: DatasetId },

    #[error("grafo inválido: {0}")]
    InvalidGraph(String),

    #[error("dataset desconocido: {0}")]
    UnknownDataset(DatasetId),

    #[error("recursos insuficientes: pedido {requested}, libre {free}")]
    InsufficientResource { requested: Resource, free: Resource },

    #[error("recursos no disponibles: pedidas {requested} unidades, otorgadas {granted}")]
    ResourceUnavailable { requested: u32, granted: u32 },

    #[error("agente desconocido: {0}")]
    UnknownAgent(AgentId),

    #[error("executor desconocido: {0}")]
    UnknownExecutor(ExecutorId),

    #[error("agente inalcanzable: {0}")]
    AgentUnreachable(String),

    #[error("la tarea {task} falló: {reason}")]
    TaskFailure { task: TaskId, reason: String },

    #[error("error de transporte en dataset {dataset} partición {partition}: {reason}")]
    ShuffleTransport {
        dataset: DatasetId,
        partition: PartitionId,
        reason: String,
    },

    #[error("error en la lógica del step: {0}")]
    StepLogic(String),

    #[error("no encontrado: {0}")]
    NotFound(String),

    #[error("flujo cancelado")]
    Cancelled,

    #[error("error de protocolo: {0}")]
    Protocol(String),

    #[error("configuración inválida: {0}")]
    InvalidConfig(String),

    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("error de io: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización: {0}")]
    Serde(#[from] serde_json::Error),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::CycleDetected { .. } => ErrorKind::CycleDetected,
            FlowError::UnresolvedPartitioner { .. } => ErrorKind::UnresolvedPartitioner,
            FlowError::InvalidGraph(_) | FlowError::UnknownDataset(_) => ErrorKind::InvalidGraph,
            FlowError::InsufficientResource { .. } => ErrorKind::InsufficientResource,
            FlowError::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            FlowError::UnknownAgent(_) => ErrorKind::UnknownAgent,
            FlowError::UnknownExecutor(_) => ErrorKind::UnknownExecutor,
            FlowError::AgentUnreachable(_) => ErrorKind::AgentUnreachable,
            FlowError::TaskFailure { .. } => ErrorKind::TaskFailure,
            FlowError::ShuffleTransport { .. } => ErrorKind::ShuffleTransport,
            FlowError::StepLogic(_) => ErrorKind::StepLogic,
            FlowError::NotFound(_) => ErrorKind::NotFound,
            FlowError::Cancelled => ErrorKind::Cancelled,
            FlowError::Protocol(_) | FlowError::Serde(_) => ErrorKind::Protocol,
            FlowError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            FlowError::Remote { kind, .. } => *kind,
            FlowError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    pub fn shuffle(dataset: DatasetId, partition: PartitionId, reason: impl Into<String>) -> Self {
        FlowError::ShuffleTransport {
            dataset,
            partition,
            reason: reason.into(),
        }
    }
}

/// Cuerpo JSON de error en las APIs HTTP y en la salida de los executors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<ErrorBody> for FlowError {
    fn from(body: ErrorBody) -> Self {
        FlowError::Remote {
            kind: body.kind,
            message: body.message,
        }
    }
}

/// Código HTTP para cada clase de error.
pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::CycleDetected
        | ErrorKind::UnresolvedPartitioner
        | ErrorKind::InvalidGraph
        | ErrorKind::Protocol
        | ErrorKind::InvalidConfig => 400,
        ErrorKind::UnknownAgent | ErrorKind::UnknownExecutor | ErrorKind::NotFound => 404,
        ErrorKind::InsufficientResource => 409,
        ErrorKind::ResourceUnavailable | ErrorKind::AgentUnreachable => 503,
        _ => 500,
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
