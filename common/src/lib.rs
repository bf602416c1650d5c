//! Tipos y runtime compartidos por broker, agentes y driver.
//!
//! El grafo lógico (`dag`) se compila a un plan físico (`plan`) de tareas
//! agrupadas en regiones; cada tarea corre en un executor (`executor`) que
//! lee y publica particiones a través de `shuffle`.

pub mod agent;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod executor;
pub mod flow;
pub mod frame;
pub mod fusion;
pub mod logging;
pub mod partition;
pub mod pipe;
pub mod plan;
pub mod resource;
pub mod rpc;
pub mod shuffle;
pub mod steps;
pub mod task;
pub mod wordcount;

pub type FlowId = String;
pub type TaskId = String;
pub type AgentId = String;
pub type ExecutorId = String;

pub type DatasetId = u32;
pub type StepId = u32;
pub type PartitionId = u32;

/// Registro opaco; los steps nativos usan JSON.
pub type Record = Vec<u8>;

pub use agent::*;
pub use config::{
    AgentConfig, BrokerConfig, PlannerConfig, RecomputeMode, RecomputePolicy, RunConfig,
    ShuffleConfig,
};
pub use dag::{
    Dataset, FlowGraph, LogicKind, OpKind, PartitionerSpec, Persistence, SourceSpec, Step,
    StepArtifact, StepOptions,
};
pub use error::{ErrorBody, ErrorKind, FlowError, Result};
pub use executor::run_task;
pub use flow::{FlowFailure, FlowStatus, RunOutcome, RunStats};
pub use plan::{compile, PhysicalPlan, Region};
pub use resource::{Resource, ResourceUsage};
pub use steps::{RecordPartitioner, StepLogic, StepRegistry};
pub use task::{
    task_id, Delivery, InputBinding, TaskAssignment, TaskReport, TaskSpec, TaskState,
};
