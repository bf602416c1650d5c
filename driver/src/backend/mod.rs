//! Dónde corren las tareas de una región: en este proceso o en el cluster.

use async_trait::async_trait;
use common::{
    task::TaskInput, task_id, DatasetId, Delivery, ErrorKind, FlowError, FlowFailure, FlowId,
    FlowStatus, InputBinding, PartitionId, Record, Result, ShuffleConfig, TaskAssignment, TaskId,
    TaskSpec,
};
use std::collections::BTreeMap;
use tokio::sync::watch;

pub mod distributed;
pub mod local;

pub use distributed::DistributedBackend;
pub use local::LocalBackend;

/// Intento que materializó una partición persistida y quién la sirve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub attempt: u32,
    /// Agente que guarda el archivo; `None` en ejecución local.
    pub agent_url: Option<String>,
}

/// Una corrida de una región con un número de intento nuevo.
#[derive(Debug, Clone)]
pub struct RegionRun {
    pub flow_id: FlowId,
    pub region: usize,
    pub attempt: u32,
    pub tasks: Vec<TaskSpec>,
    /// Ubicación de cada partición persistida que la región lee.
    pub staged: BTreeMap<(DatasetId, PartitionId), Placement>,
    pub timeout_ms: u64,
    pub shuffle: ShuffleConfig,
    pub stop: watch::Receiver<bool>,
}

impl RegionRun {
    /// Arma la asignación de una tarea. Para las entradas en streaming el
    /// productor es de la misma corrida; `placed` dice en qué agente quedó.
    pub fn assignment<F>(&self, spec: &TaskSpec, placed: F) -> Result<TaskAssignment>
    where
        F: Fn(&TaskId) -> Option<String>,
    {
        let mut bindings = Vec::new();
        for input in &spec.inputs {
            for p in &input.partitions {
                bindings.push(self.binding(input, *p, &placed)?);
            }
        }
        Ok(TaskAssignment {
            flow_id: self.flow_id.clone(),
            attempt: self.attempt,
            spec: spec.clone(),
            bindings,
            timeout_ms: self.timeout_ms,
            shuffle: self.shuffle.clone(),
        })
    }

    fn binding<F>(&self, input: &TaskInput, partition: PartitionId, placed: &F) -> Result<InputBinding>
    where
        F: Fn(&TaskId) -> Option<String>,
    {
        match input.delivery {
            Delivery::Streamed => Ok(InputBinding {
                dataset: input.dataset,
                partition,
                attempt: self.attempt,
                agent_url: placed(&task_id(input.dataset, partition)),
            }),
            Delivery::Staged => {
                let placement = self.staged.get(&(input.dataset, partition)).ok_or_else(|| {
                    FlowError::NotFound(format!(
                        "d{}-p{} no está materializado",
                        input.dataset, partition
                    ))
                })?;
                Ok(InputBinding {
                    dataset: input.dataset,
                    partition,
                    attempt: placement.attempt,
                    agent_url: placement.agent_url.clone(),
                })
            }
        }
    }
}

/// Resultado de una corrida exitosa: dónde quedó cada partición producida.
#[derive(Debug, Clone, Default)]
pub struct RegionDone {
    pub placements: BTreeMap<(DatasetId, PartitionId), Option<String>>,
    pub records_out: u64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Corre todas las tareas de la región a la vez. Si una falla, las demás
    /// se detienen y se devuelve la causa.
    async fn run_region(&self, run: &RegionRun) -> std::result::Result<RegionDone, FlowFailure>;

    /// ¿Sigue disponible la partición persistida?
    async fn is_available(
        &self,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
        placement: &Placement,
    ) -> bool;

    async fn read_partition(
        &self,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
        placement: &Placement,
    ) -> Result<Vec<Record>>;

    /// Libera un dataset que ya nadie va a leer.
    async fn release_dataset(&self, flow_id: &str, dataset: DatasetId, agents: Vec<String>);

    /// Limpieza al terminar el flow.
    async fn finish(&self, flow_id: &str, status: FlowStatus);
}

/// Parte las tareas de una región en etapas, una por dataset y en el orden
/// de `datasets` (topológico). Toda entrega en streaming pasa a persistida:
/// cada etapa lee sólo archivos de las anteriores y puede correr por tandas.
pub fn staged_stages(datasets: &[DatasetId], tasks: &[TaskSpec]) -> Vec<Vec<TaskSpec>> {
    datasets
        .iter()
        .map(|ds| {
            tasks
                .iter()
                .filter(|t| t.dataset == *ds)
                .cloned()
                .map(|mut t| {
                    if t.output.delivery == Delivery::Streamed {
                        t.output.delivery = Delivery::Staged;
                        t.output.consumers.clear();
                    }
                    for input in &mut t.inputs {
                        // el ruteo que hacía el productor lo aplica ahora el lector
                        input.delivery = Delivery::Staged;
                    }
                    t
                })
                .collect::<Vec<_>>()
        })
        .filter(|stage| !stage.is_empty())
        .collect()
}

/// Resuelve cuando la señal de parada pasa a `true`. Si el emisor ya no
/// existe, no resuelve nunca.
pub async fn cancelled(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Entre varias fallas de una región, la que no es consecuencia de otra:
/// un error de transporte suele ser el eco de la falla del productor.
pub fn root_cause(mut failures: Vec<FlowFailure>) -> Option<FlowFailure> {
    let pos = failures
        .iter()
        .position(|f| f.kind != ErrorKind::ShuffleTransport)
        .unwrap_or(0);
    if failures.is_empty() {
        None
    } else {
        Some(failures.swap_remove(pos))
    }
}

pub fn failure(
    err: &FlowError,
    task: Option<TaskId>,
    dataset: Option<DatasetId>,
) -> FlowFailure {
    FlowFailure {
        kind: err.kind(),
        task,
        dataset,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{FlowGraph, OpKind, PartitionerSpec, Persistence, SourceSpec, StepArtifact, StepOptions};

    fn f(kind: ErrorKind, msg: &str) -> FlowFailure {
        FlowFailure {
            kind,
            task: None,
            dataset: None,
            message: msg.to_string(),
        }
    }

    #[test]
    fn root_cause_prefiere_errores_que_no_son_de_transporte() {
        let picked = root_cause(vec![
            f(ErrorKind::ShuffleTransport, "eco"),
            f(ErrorKind::StepLogic, "causa"),
        ])
        .unwrap();
        assert_eq!(picked.message, "causa");

        let only = root_cause(vec![f(ErrorKind::ShuffleTransport, "x")]).unwrap();
        assert_eq!(only.kind, ErrorKind::ShuffleTransport);
        assert!(root_cause(Vec::new()).is_none());
    }

    #[test]
    fn etapas_persistidas_siguen_el_orden_y_no_dejan_streaming() {
        let mut g = FlowGraph::new("t");
        let src = g
            .add_source(
                "s",
                SourceSpec::inline(vec![vec![b"{}".to_vec()]; 3]),
                Persistence::Memory,
            )
            .unwrap();
        let out = g
            .add_step_with(
                &[src],
                OpKind::Reduce,
                PartitionerSpec::hash("token"),
                StepArtifact::native("sum_by_key"),
                StepOptions::partitions(2),
            )
            .unwrap();
        let plan = g.compile().unwrap();
        let region = &plan.regions[0];
        let tasks: Vec<TaskSpec> = region
            .tasks
            .iter()
            .filter_map(|id| plan.task(id).cloned())
            .collect();
        assert!(tasks.iter().any(|t| t.output.delivery == Delivery::Streamed));

        let stages = staged_stages(&region.datasets, &tasks);
        assert_eq!(stages.len(), 2);
        assert!(stages[0].iter().all(|t| t.dataset == src));
        assert_eq!(stages[0].len(), 3);
        assert_eq!(stages[1].len(), 2);
        for t in stages.iter().flatten() {
            assert_eq!(t.output.delivery, Delivery::Staged);
            assert!(t.output.consumers.is_empty());
            assert!(t.inputs.iter().all(|i| i.delivery == Delivery::Staged));
        }
        // el reduce lee todas las particiones y filtra por su destino
        let reduce = &stages[1][1];
        assert_eq!(reduce.dataset, out);
        assert_eq!(reduce.inputs[0].partitions, vec![0, 1, 2]);
        assert_eq!(reduce.inputs[0].route.as_ref().map(|r| r.target), Some(1));
    }

    #[tokio::test]
    async fn cancelled_resuelve_al_activar_la_senal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { cancelled(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
