use async_trait::async_trait;
use common::{
    run_task,
    shuffle::{spill, LocalTransport, Transport},
    DatasetId, ErrorKind, FlowError, FlowFailure, FlowStatus, PartitionId, Record, Result,
    StepRegistry, TaskReport, TaskState,
};
use std::{path::PathBuf, sync::Arc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{cancelled, failure, root_cause, Backend, Placement, RegionDone, RegionRun};

/// Todas las tareas como tareas tokio de este proceso. El streaming pasa por
/// el hub en memoria; los datasets persistidos van al directorio de spill.
pub struct LocalBackend {
    registry: Arc<StepRegistry>,
    transport: Arc<LocalTransport>,
    spill_root: PathBuf,
}

impl LocalBackend {
    pub fn new(registry: Arc<StepRegistry>, spill_root: PathBuf) -> Self {
        Self {
            registry,
            transport: Arc::new(LocalTransport::new(spill_root.clone())),
            spill_root,
        }
    }
}

fn report_failure(report: &TaskReport, dataset: DatasetId) -> FlowFailure {
    let (kind, message) = match &report.error {
        Some(e) => (e.kind, e.message.clone()),
        None => (ErrorKind::TaskFailure, "tarea fallida sin detalle".to_string()),
    };
    FlowFailure {
        kind,
        task: Some(report.task_id.clone()),
        dataset: Some(dataset),
        message,
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn run_region(&self, run: &RegionRun) -> std::result::Result<RegionDone, FlowFailure> {
        let mut set = JoinSet::new();
        for spec in &run.tasks {
            let assignment = run
                .assignment(spec, |_| None)
                .map_err(|e| failure(&e, Some(spec.id.clone()), Some(spec.dataset)))?;
            let registry = self.registry.clone();
            let transport = self.transport.clone();
            let dataset = spec.dataset;
            set.spawn(async move {
                let report = run_task(&assignment, &registry, transport.as_ref()).await;
                (report, dataset)
            });
        }

        let mut done = RegionDone::default();
        let mut failures = Vec::new();
        let mut stop = run.stop.clone();

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((report, dataset)) if report.state == TaskState::Succeeded => {
                            debug!("{} OK ({} registros)", report.task_id, report.records_out);
                            done.records_out += report.records_out;
                            if let Some(spec) = run.tasks.iter().find(|t| t.id == report.task_id) {
                                done.placements.insert((dataset, spec.partition), None);
                            }
                        }
                        Ok((report, dataset)) => {
                            failures.push(report_failure(&report, dataset));
                            set.abort_all();
                        }
                        // abortada tras otra falla
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            failures.push(failure(
                                &FlowError::Protocol(format!("tarea local terminó mal: {e}")),
                                None,
                                None,
                            ));
                            set.abort_all();
                        }
                    }
                }
                _ = cancelled(&mut stop) => {
                    set.shutdown().await;
                    self.transport.hub().purge_attempt(&run.flow_id, run.attempt);
                    return Err(failure(&FlowError::Cancelled, None, None));
                }
            }
        }

        match root_cause(failures) {
            None => Ok(done),
            Some(f) => {
                let purged = self.transport.hub().purge_attempt(&run.flow_id, run.attempt);
                if purged > 0 {
                    debug!("descartados {} buffers del intento {}", purged, run.attempt);
                }
                Err(f)
            }
        }
    }

    async fn is_available(
        &self,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
        _placement: &Placement,
    ) -> bool {
        spill::partition_exists(&self.spill_root, flow_id, dataset, partition).await
    }

    async fn read_partition(
        &self,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
        _placement: &Placement,
    ) -> Result<Vec<Record>> {
        spill::read_partition(&self.spill_root, flow_id, dataset, partition).await
    }

    async fn release_dataset(&self, flow_id: &str, dataset: DatasetId, _agents: Vec<String>) {
        if let Err(e) = spill::remove_dataset(&self.spill_root, flow_id, dataset).await {
            warn!("no se pudo liberar d{} del flow {}: {}", dataset, flow_id, e);
        }
    }

    async fn finish(&self, flow_id: &str, status: FlowStatus) {
        self.transport.hub().purge_flow(flow_id);
        if let Err(e) = spill::remove_flow(&self.spill_root, flow_id).await {
            warn!("no se pudo borrar el spill del flow {} ({:?}): {}", flow_id, status, e);
        }
    }
}
