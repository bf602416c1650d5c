use common::{
    shuffle::spill, DatasetId, ErrorBody, ErrorKind, ExecutorHandle, ExecutorStatus, FlowError,
    Result, StopResponse, TaskAssignment, TaskState,
};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::launcher::{ExecutorProcess, LaunchSpec, ProcessExit};
use crate::state::{lock, AgentState, ExecutorRecord};

/// Reserva la capacidad de la tarea y lanza su executor.
pub async fn start_executor(state: &AgentState, assignment: TaskAssignment) -> Result<ExecutorHandle> {
    let requested = assignment.spec.resources;
    {
        let mut res = lock(&state.resources);
        if !res.try_reserve(&requested) {
            return Err(FlowError::InsufficientResource {
                requested,
                free: res.free(),
            });
        }
    }

    let executor_id = uuid::Uuid::new_v4().to_string();
    let flow_id = assignment.flow_id.clone();
    let task_id = assignment.spec.id.clone();
    let attempt = assignment.attempt;

    let spec = LaunchSpec {
        executor_id: executor_id.clone(),
        assignment,
        agent_url: state.url.clone(),
        data_host: state.data_host.clone(),
        agent_data_addr: state.data_addr.clone(),
        storage_dir: state.config.storage_dir.clone(),
    };

    let process = match state.launcher.launch(spec).await {
        Ok(p) => p,
        Err(e) => {
            lock(&state.resources).release(&requested);
            return Err(e);
        }
    };

    let handle = ExecutorHandle {
        executor_id: executor_id.clone(),
        agent_id: state.agent_id().unwrap_or_default(),
        agent_url: state.url.clone(),
        task_id: task_id.clone(),
        attempt,
        pid: process.pid(),
    };

    let (stop_tx, stop_rx) = oneshot::channel();
    lock(&state.executors).insert(
        executor_id.clone(),
        ExecutorRecord {
            handle: handle.clone(),
            flow_id,
            resources: requested,
            state: TaskState::Running,
            report: None,
            error: None,
            started_at: Instant::now(),
            finished_at: None,
            stop: Some(stop_tx),
        },
    );

    info!(
        "executor {} lanzado para {} (intento {}, pid {:?})",
        executor_id, task_id, attempt, handle.pid
    );

    let st = state.clone();
    tokio::spawn(async move {
        supervise(st, executor_id, process, stop_rx).await;
    });

    Ok(handle)
}

enum Ending {
    Exited(Result<ProcessExit>),
    Stopped,
}

/// Espera a que el executor termine (o a que lo detengan), registra el
/// resultado y devuelve la capacidad.
async fn supervise(
    state: AgentState,
    executor_id: String,
    mut process: Box<dyn ExecutorProcess>,
    stop_rx: oneshot::Receiver<()>,
) {
    let ending = tokio::select! {
        r = process.wait() => Ending::Exited(r),
        _ = stop_rx => Ending::Stopped,
    };

    let (exit, stopped) = match ending {
        Ending::Exited(r) => (r, false),
        Ending::Stopped => {
            let _ = process.kill().await;
            (process.wait().await, true)
        }
    };

    let (next, report, error) = if stopped {
        (
            TaskState::Failed,
            None,
            Some(FlowError::Cancelled.to_body()),
        )
    } else {
        match exit {
            Ok(exit) if exit.success => (TaskState::Succeeded, exit.report, None),
            Ok(exit) => {
                let error = exit
                    .error
                    .or_else(|| exit.report.as_ref().and_then(|r| r.error.clone()))
                    .unwrap_or_else(|| ErrorBody {
                        kind: ErrorKind::TaskFailure,
                        message: format!("executor terminó con código {:?}", exit.code),
                    });
                (TaskState::Failed, exit.report, Some(error))
            }
            Err(e) => (TaskState::Failed, None, Some(e.to_body())),
        }
    };

    let resources = {
        let mut executors = lock(&state.executors);
        let Some(record) = executors.get_mut(&executor_id) else {
            return;
        };
        record.state = next;
        record.report = report;
        record.error = error.clone();
        record.finished_at = Some(Instant::now());
        record.stop = None;
        record.resources
    };
    lock(&state.resources).release(&resources);

    match (next, error) {
        (TaskState::Succeeded, _) => info!("executor {} terminó OK", executor_id),
        (_, Some(e)) => warn!("executor {} falló: {:?} {}", executor_id, e.kind, e.message),
        _ => {}
    }
}

pub fn executor_status(state: &AgentState, executor_id: &str) -> Result<ExecutorStatus> {
    let executors = lock(&state.executors);
    let record = executors
        .get(executor_id)
        .ok_or_else(|| FlowError::UnknownExecutor(executor_id.to_string()))?;
    Ok(ExecutorStatus {
        handle: record.handle.clone(),
        state: record.state,
        report: record.report.clone(),
        error: record.error.clone(),
    })
}

/// Idempotente: detener un executor ya terminado sólo informa que no corría.
pub fn stop_executor(state: &AgentState, executor_id: &str) -> Result<StopResponse> {
    let mut executors = lock(&state.executors);
    let record = executors
        .get_mut(executor_id)
        .ok_or_else(|| FlowError::UnknownExecutor(executor_id.to_string()))?;

    let was_running = match record.stop.take() {
        Some(tx) => {
            let _ = tx.send(());
            true
        }
        None => false,
    };
    if was_running {
        info!("deteniendo executor {}", executor_id);
    }
    Ok(StopResponse {
        ok: true,
        was_running,
    })
}

/// Detiene todos los executors en curso; devuelve cuántos.
pub fn stop_all(state: &AgentState) -> usize {
    let mut executors = lock(&state.executors);
    let mut n = 0;
    for record in executors.values_mut() {
        if let Some(tx) = record.stop.take() {
            let _ = tx.send(());
            n += 1;
        }
    }
    n
}

/// Detiene los executors del flow, olvida sus ubicaciones y borra sus datos.
pub async fn cancel_flow(state: &AgentState, flow_id: &str) -> Result<usize> {
    let stopped = {
        let mut executors = lock(&state.executors);
        let mut n = 0;
        for record in executors.values_mut().filter(|r| r.flow_id == flow_id) {
            if let Some(tx) = record.stop.take() {
                let _ = tx.send(());
                n += 1;
            }
        }
        n
    };
    lock(&state.locations).remove_flow(flow_id);
    spill::remove_flow(&state.config.storage_dir, flow_id).await?;
    info!("flow {} cancelado: {} executors detenidos", flow_id, stopped);
    Ok(stopped)
}

pub async fn release_dataset(state: &AgentState, flow_id: &str, dataset: DatasetId) -> Result<bool> {
    let forgotten = lock(&state.locations).remove_dataset(flow_id, dataset);
    let removed = spill::remove_dataset(&state.config.storage_dir, flow_id, dataset).await?;
    Ok(removed || forgotten > 0)
}
