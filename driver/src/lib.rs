//! Programa conductor: compila un `FlowGraph` y lo corre en este proceso o
//! en un cluster de broker + agentes.

pub mod backend;
pub mod cli;
pub mod scheduler;

use common::{
    compile, FlowError, FlowGraph, LogicKind, Result, RunConfig, RunOutcome, StepRegistry,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use backend::{Backend, DistributedBackend, LocalBackend};
use scheduler::Scheduler;

/// Compila y corre el grafo con el backend dado. Los errores de compilación
/// vuelven como `Err`; las fallas de ejecución quedan en el `RunOutcome`.
pub async fn run_with(
    backend: &dyn Backend,
    graph: &FlowGraph,
    config: &RunConfig,
    stop: watch::Receiver<bool>,
) -> Result<RunOutcome> {
    config.validate()?;
    let plan = compile(graph, &config.planner)?;
    let flow_id = format!("{}-{}", graph.name, uuid::Uuid::new_v4().simple());
    info!("flow {} compilado", flow_id);
    Ok(Scheduler::new(backend, &plan, config, flow_id, stop).run().await)
}

/// Ejecución en un solo proceso, sin broker.
pub async fn run_local(
    graph: &FlowGraph,
    registry: Arc<StepRegistry>,
    config: &RunConfig,
) -> Result<RunOutcome> {
    let (_stop_tx, stop) = watch::channel(false);
    run_local_until(graph, registry, config, stop).await
}

/// Como `run_local`, cancelable: el flow se detiene cuando `stop` pasa a `true`.
pub async fn run_local_until(
    graph: &FlowGraph,
    registry: Arc<StepRegistry>,
    config: &RunConfig,
    stop: watch::Receiver<bool>,
) -> Result<RunOutcome> {
    let backend = LocalBackend::new(registry, config.spill_dir.clone());
    run_with(&backend, graph, config, stop).await
}

/// Ejecución distribuida: el broker en `broker_url` asigna los agentes.
pub async fn run_distributed(
    graph: &FlowGraph,
    broker_url: &str,
    config: &RunConfig,
) -> Result<RunOutcome> {
    let (_stop_tx, stop) = watch::channel(false);
    run_distributed_until(graph, broker_url, config, stop).await
}

pub async fn run_distributed_until(
    graph: &FlowGraph,
    broker_url: &str,
    config: &RunConfig,
    stop: watch::Receiver<bool>,
) -> Result<RunOutcome> {
    check_native_steps(graph, &StepRegistry::with_builtins())?;
    let backend = DistributedBackend::new(broker_url, config);
    run_with(&backend, graph, config, stop).await
}

/// Los executors remotos sólo conocen los steps nativos incluidos; un step
/// nativo desconocido se rechaza antes de pedir capacidad.
fn check_native_steps(graph: &FlowGraph, registry: &StepRegistry) -> Result<()> {
    for step in &graph.steps {
        for artifact in &step.logic {
            if artifact.kind == LogicKind::Native && !registry.has_step(&artifact.id) {
                return Err(FlowError::StepLogic(format!(
                    "el step nativo {} no está disponible en los executors remotos",
                    artifact.id
                )));
            }
        }
    }
    Ok(())
}
