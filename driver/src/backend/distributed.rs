use async_trait::async_trait;
use common::{
    frame::PullRequest,
    rpc::{AgentClient, BrokerClient},
    shuffle::{open_remote, PartitionReader},
    Allocation, AllocationRequest, DatasetId, ErrorKind, ExecutorHandle, FlowError, FlowFailure,
    Delivery, FlowStatus, PartitionId, Record, ReleaseRequest, Resource, Result, RunConfig,
    TaskId, TaskSpec, TaskState,
};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
    time::Duration,
};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, warn};

use super::{cancelled, failure, root_cause, Backend, Placement, RegionDone, RegionRun};

/// Margen sobre el timeout de la tarea antes de que el driver la dé por
/// colgada (el executor aplica el suyo primero).
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Ejecución en el cluster: el broker asigna capacidad, cada agente lanza un
/// executor por tarea y el driver consulta su estado hasta que terminan.
pub struct DistributedBackend {
    broker: BrokerClient,
    agents: AgentClient,
    allocation_retries: u32,
    allocation_backoff: Duration,
    poll_interval: Duration,
    /// Agentes que recibieron tareas de algún flow; se limpian al final.
    touched: Mutex<BTreeSet<String>>,
}

/// Una unidad de capacidad reservada para una tarea.
#[derive(Debug, Clone)]
struct Grant {
    allocation: Allocation,
    resource: Resource,
}

struct Running {
    handle: ExecutorHandle,
    dataset: DatasetId,
    partition: PartitionId,
    started: Instant,
    done: bool,
}

impl DistributedBackend {
    pub fn new(broker_url: &str, config: &RunConfig) -> Self {
        Self {
            broker: BrokerClient::new(broker_url),
            agents: AgentClient::new(),
            allocation_retries: config.allocation_retries,
            allocation_backoff: config.allocation_backoff,
            poll_interval: config.poll_interval,
            touched: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    fn touch(&self, agent: &str) {
        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent.to_string());
    }

    fn touched(&self) -> Vec<String> {
        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    async fn release(&self, grants: &[Grant]) {
        for g in grants {
            let req = ReleaseRequest {
                agent_id: g.allocation.agent_id.clone(),
                resource: g.resource,
            };
            if let Err(e) = self.broker.release(&req).await {
                warn!("no se pudo devolver capacidad de {}: {}", g.allocation.agent_id, e);
            }
        }
    }

    /// Pide capacidad para `tasks`. Con `partial`, alcanza con que llegue
    /// algo: se devuelven sólo las tareas con capacidad. Sin `partial`, una
    /// asignación incompleta se devuelve entera y se reintenta con backoff.
    /// El índice de cada grant es el de su tarea en `tasks`.
    async fn allocate(
        &self,
        tasks: &[TaskSpec],
        partial: bool,
        stop: &mut watch::Receiver<bool>,
    ) -> std::result::Result<Vec<(usize, Grant)>, FlowFailure> {
        // tareas agrupadas por requerimiento, en orden de aparición
        let mut groups: Vec<(Resource, Vec<usize>)> = Vec::new();
        for (i, t) in tasks.iter().enumerate() {
            match groups.iter_mut().find(|(r, _)| *r == t.resources) {
                Some((_, idx)) => idx.push(i),
                None => groups.push((t.resources, vec![i])),
            }
        }

        let mut attempt = 0;
        loop {
            let mut grants: Vec<(usize, Grant)> = Vec::with_capacity(tasks.len());
            let mut short = None;

            for (resource, idx) in &groups {
                let req = AllocationRequest {
                    resource: *resource,
                    count: idx.len() as u32,
                };
                match self.broker.request_allocation(&req).await {
                    Ok(resp) => {
                        let granted = resp.allocations.len();
                        for (task, allocation) in idx.iter().zip(resp.allocations) {
                            grants.push((
                                *task,
                                Grant {
                                    allocation,
                                    resource: *resource,
                                },
                            ));
                        }
                        if granted < idx.len() {
                            short = Some(FlowError::ResourceUnavailable {
                                requested: idx.len() as u32,
                                granted: granted as u32,
                            });
                            if !partial {
                                break;
                            }
                        }
                    }
                    Err(e) if partial && e.kind() == ErrorKind::ResourceUnavailable => {
                        short = Some(e);
                    }
                    Err(e) => {
                        short = Some(e);
                        break;
                    }
                }
            }

            let accepted = match &short {
                None => true,
                Some(e) => partial && !grants.is_empty() && e.kind() == ErrorKind::ResourceUnavailable,
            };
            if accepted {
                grants.sort_by_key(|(task, _)| *task);
                return Ok(grants);
            }
            let err = short.unwrap_or(FlowError::ResourceUnavailable {
                requested: tasks.len() as u32,
                granted: 0,
            });

            let held: Vec<Grant> = grants.into_iter().map(|(_, g)| g).collect();
            self.release(&held).await;

            if attempt >= self.allocation_retries {
                return Err(failure(&err, None, None));
            }
            attempt += 1;
            let wait = self.allocation_backoff * attempt;
            warn!(
                "asignación incompleta ({}); reintento {}/{} en {:?}",
                err, attempt, self.allocation_retries, wait
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancelled(stop) => return Err(failure(&FlowError::Cancelled, None, None)),
            }
        }
    }

    async fn stop_all(&self, running: &[Running]) {
        for r in running.iter().filter(|r| !r.done) {
            if let Err(e) = self
                .agents
                .stop_executor(&r.handle.agent_url, &r.handle.executor_id)
                .await
            {
                debug!("stop de {} falló: {}", r.handle.executor_id, e);
            }
        }
    }

    /// Lanza un executor por tarea en el agente que le tocó. Si el agente
    /// rechaza por capacidad (el broker tenía una vista vieja), la tarea se
    /// reubica con otra asignación; el grant rechazado pasa a `refused` y no
    /// se devuelve hasta el final, así el broker no lo vuelve a ofrecer.
    async fn launch(
        &self,
        run: &RegionRun,
        tasks: &[TaskSpec],
        grants: &mut [Grant],
        refused: &mut Vec<Grant>,
        stop: &mut watch::Receiver<bool>,
    ) -> std::result::Result<Vec<Running>, FlowFailure> {
        let mut placed: HashMap<TaskId, String> = tasks
            .iter()
            .zip(grants.iter())
            .map(|(t, g)| (t.id.clone(), g.allocation.address.clone()))
            .collect();

        let mut running = Vec::with_capacity(tasks.len());
        for (i, spec) in tasks.iter().enumerate() {
            let mut moves = 0;
            loop {
                let agent = grants[i].allocation.address.clone();
                let started = match run.assignment(spec, |t| placed.get(t).cloned()) {
                    Ok(assignment) => {
                        self.touch(&agent);
                        self.agents.start_executor(&agent, &assignment).await
                    }
                    Err(e) => Err(e),
                };
                let err = match started {
                    Ok(handle) => {
                        debug!("{} en {} (executor {})", spec.id, agent, handle.executor_id);
                        running.push(Running {
                            handle,
                            dataset: spec.dataset,
                            partition: spec.partition,
                            started: Instant::now(),
                            done: false,
                        });
                        break;
                    }
                    Err(e) => e,
                };

                if err.kind() != ErrorKind::InsufficientResource || moves >= self.allocation_retries {
                    warn!("no se pudo lanzar {} en {}: {}", spec.id, agent, err);
                    self.stop_all(&running).await;
                    return Err(failure(&err, Some(spec.id.clone()), Some(spec.dataset)));
                }
                moves += 1;
                warn!(
                    "{} rechazada por {} ({}); reubicación {}/{}",
                    spec.id, agent, err, moves, self.allocation_retries
                );
                let wait = self.allocation_backoff * moves;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancelled(stop) => {
                        self.stop_all(&running).await;
                        return Err(failure(&FlowError::Cancelled, None, None));
                    }
                }
                match self.allocate(std::slice::from_ref(spec), false, stop).await {
                    Ok(mut fresh) => {
                        let Some((_, grant)) = fresh.pop() else {
                            continue;
                        };
                        placed.insert(spec.id.clone(), grant.allocation.address.clone());
                        refused.push(std::mem::replace(&mut grants[i], grant));
                    }
                    Err(f) => {
                        self.stop_all(&running).await;
                        return Err(f);
                    }
                }
            }
        }
        Ok(running)
    }

    /// Consulta el estado de los executors hasta que todos terminan o alguno
    /// falla.
    async fn poll_until_done(
        &self,
        run: &RegionRun,
        running: &mut [Running],
        stop: &mut watch::Receiver<bool>,
    ) -> std::result::Result<RegionDone, FlowFailure> {
        let deadline = Duration::from_millis(run.timeout_ms) + TIMEOUT_GRACE;
        let mut done = RegionDone::default();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancelled(stop) => return Err(failure(&FlowError::Cancelled, None, None)),
            }

            let mut failures = Vec::new();
            for r in running.iter_mut().filter(|r| !r.done) {
                let task = Some(r.handle.task_id.clone());
                match self
                    .agents
                    .executor_status(&r.handle.agent_url, &r.handle.executor_id)
                    .await
                {
                    Ok(st) if st.state == TaskState::Succeeded => {
                        r.done = true;
                        done.records_out += st.report.map(|rep| rep.records_out).unwrap_or(0);
                        done.placements.insert(
                            (r.dataset, r.partition),
                            Some(r.handle.agent_url.clone()),
                        );
                    }
                    Ok(st) if st.state == TaskState::Failed => {
                        r.done = true;
                        let (kind, message) = match st.error {
                            Some(e) => (e.kind, e.message),
                            None => (ErrorKind::TaskFailure, "executor falló".to_string()),
                        };
                        failures.push(FlowFailure {
                            kind,
                            task,
                            dataset: Some(r.dataset),
                            message,
                        });
                    }
                    Ok(_) if run.timeout_ms > 0 && r.started.elapsed() > deadline => {
                        failures.push(failure(
                            &FlowError::TaskFailure {
                                task: r.handle.task_id.clone(),
                                reason: format!("sin respuesta tras {:?}", deadline),
                            },
                            task,
                            Some(r.dataset),
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // agente caído o reiniciado: sus tareas se pierden
                        let err = match e.kind() {
                            ErrorKind::UnknownExecutor => {
                                FlowError::AgentUnreachable(r.handle.agent_url.clone())
                            }
                            _ => e,
                        };
                        failures.push(failure(&err, task, Some(r.dataset)));
                    }
                }
            }

            if let Some(f) = root_cause(failures) {
                return Err(f);
            }
            if running.iter().all(|r| r.done) {
                return Ok(done);
            }
        }
    }
}

/// Tareas que no se leen entre sí: todas sus entradas y salidas persistidas.
/// Se pueden correr por tandas, con la capacidad que haya.
fn independent(tasks: &[TaskSpec]) -> bool {
    tasks.iter().all(|t| {
        t.output.delivery == Delivery::Staged
            && t.inputs.iter().all(|i| i.delivery == Delivery::Staged)
    })
}

impl DistributedBackend {
    /// Corre un grupo de tareas que ya tienen capacidad asignada.
    async fn run_wave(
        &self,
        run: &RegionRun,
        tasks: &[TaskSpec],
        mut grants: Vec<Grant>,
        stop: &mut watch::Receiver<bool>,
    ) -> std::result::Result<RegionDone, FlowFailure> {
        let mut refused = Vec::new();
        let result = match self.launch(run, tasks, &mut grants, &mut refused, stop).await {
            Ok(mut running) => {
                let watched = self.poll_until_done(run, &mut running, stop).await;
                if watched.is_err() {
                    self.stop_all(&running).await;
                }
                watched
            }
            Err(f) => Err(f),
        };
        self.release(&grants).await;
        self.release(&refused).await;
        result
    }
}

#[async_trait]
impl Backend for DistributedBackend {
    async fn run_region(&self, run: &RegionRun) -> std::result::Result<RegionDone, FlowFailure> {
        let mut stop = run.stop.clone();
        // en streaming productores y consumidores tienen que correr juntos
        let waves = independent(&run.tasks);
        let mut pending: Vec<TaskSpec> = run.tasks.clone();
        let mut done = RegionDone::default();
        let mut wave = 0;

        while !pending.is_empty() {
            let granted = self.allocate(&pending, waves, &mut stop).await?;
            let picked: BTreeSet<usize> = granted.iter().map(|(i, _)| *i).collect();
            let grants: Vec<Grant> = granted.into_iter().map(|(_, g)| g).collect();
            let (batch, rest): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .enumerate()
                .partition(|(i, _)| picked.contains(i));
            let batch: Vec<TaskSpec> = batch.into_iter().map(|(_, t)| t).collect();
            pending = rest.into_iter().map(|(_, t)| t).collect();

            info!(
                "región {} intento {} tanda {}: {} tareas en {} agentes ({} pendientes)",
                run.region,
                run.attempt,
                wave,
                batch.len(),
                grants
                    .iter()
                    .map(|g| g.allocation.agent_id.as_str())
                    .collect::<BTreeSet<_>>()
                    .len(),
                pending.len()
            );
            let part = self.run_wave(run, &batch, grants, &mut stop).await?;
            done.records_out += part.records_out;
            done.placements.extend(part.placements);
            wave += 1;
        }
        Ok(done)
    }

    async fn is_available(
        &self,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
        placement: &Placement,
    ) -> bool {
        let Some(agent) = placement.agent_url.as_deref() else {
            return false;
        };
        match self
            .agents
            .lookup_location(agent, flow_id, dataset, partition)
            .await
        {
            Ok(Some(desc)) => desc.staged && desc.attempt == placement.attempt,
            Ok(None) => false,
            Err(e) => {
                debug!("d{}-p{} inaccesible en {}: {}", dataset, partition, agent, e);
                false
            }
        }
    }

    async fn read_partition(
        &self,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
        placement: &Placement,
    ) -> Result<Vec<Record>> {
        let agent = placement.agent_url.as_deref().ok_or_else(|| {
            FlowError::NotFound(format!("d{dataset}-p{partition} sin agente"))
        })?;
        let desc = self
            .agents
            .lookup_location(agent, flow_id, dataset, partition)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("d{dataset}-p{partition} en {agent}")))?;

        let mut reader = open_remote(
            &desc.data_addr,
            dataset,
            partition,
            PullRequest {
                flow_id: flow_id.to_string(),
                consumer: "driver".to_string(),
                attempt: desc.attempt,
                staged: true,
            },
        )
        .await?;
        let mut out = Vec::new();
        while let Some(r) = reader.next_record().await? {
            out.push(r);
        }
        Ok(out)
    }

    async fn release_dataset(&self, flow_id: &str, dataset: DatasetId, agents: Vec<String>) {
        for agent in agents {
            if let Err(e) = self.agents.release_dataset(&agent, flow_id, dataset).await {
                warn!("no se pudo liberar d{} en {}: {}", dataset, agent, e);
            }
        }
    }

    async fn finish(&self, flow_id: &str, status: FlowStatus) {
        if status == FlowStatus::Succeeded {
            return;
        }
        // flow fallido o cancelado: nada de lo producido sirve
        for agent in self.touched() {
            if let Err(e) = self.agents.cancel_flow(&agent, flow_id).await {
                warn!("cancelación del flow {} en {} falló: {}", flow_id, agent, e);
            }
        }
    }
}
