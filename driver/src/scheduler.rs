use chrono::Utc;
use common::{
    DatasetId, Delivery, ErrorKind, FlowError, FlowFailure, FlowId, FlowStatus, PartitionId,
    Persistence, PhysicalPlan, RecomputeMode, Record, RunConfig, RunOutcome, RunStats,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{cancelled, failure, staged_stages, Backend, Placement, RegionDone, RegionRun};

/// Orquesta las regiones de un plan: las corre en orden, reintenta las que
/// fallan y recomputa los datasets que se perdieron.
pub struct Scheduler<'a> {
    backend: &'a dyn Backend,
    plan: &'a PhysicalPlan,
    config: &'a RunConfig,
    flow_id: FlowId,
    stop: watch::Receiver<bool>,
    /// Particiones persistidas disponibles, con el intento que las produjo.
    placements: BTreeMap<(DatasetId, PartitionId), Placement>,
    /// Próximo número de intento por región.
    next_attempt: HashMap<usize, u32>,
    completed: HashSet<usize>,
    released: HashSet<DatasetId>,
    stats: RunStats,
}

type Outcome<T> = std::result::Result<T, FlowFailure>;

impl<'a> Scheduler<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        plan: &'a PhysicalPlan,
        config: &'a RunConfig,
        flow_id: FlowId,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            plan,
            config,
            flow_id,
            stop,
            placements: BTreeMap::new(),
            next_attempt: HashMap::new(),
            completed: HashSet::new(),
            released: HashSet::new(),
            stats: RunStats {
                regions: plan.regions.len() as u32,
                tasks: plan.tasks.len() as u32,
                ..RunStats::default()
            },
        }
    }

    pub async fn run(mut self) -> RunOutcome {
        let started_at = Utc::now();
        info!(
            "flow {}: {} regiones, {} tareas",
            self.flow_id, self.stats.regions, self.stats.tasks
        );

        let result = self.run_all().await;
        let (status, failure, outputs) = match result {
            Ok(outputs) => (FlowStatus::Succeeded, None, outputs),
            Err(f) if f.kind == ErrorKind::Cancelled => {
                (FlowStatus::Cancelled, Some(f), BTreeMap::new())
            }
            Err(f) => (FlowStatus::Failed, Some(f), BTreeMap::new()),
        };

        match &failure {
            None => info!("flow {} terminó OK", self.flow_id),
            Some(f) => warn!(
                "flow {} terminó {:?}: {:?} en {:?} ({})",
                self.flow_id, status, f.kind, f.task, f.message
            ),
        }
        self.backend.finish(&self.flow_id, status).await;

        RunOutcome {
            flow_id: self.flow_id,
            status,
            failure,
            outputs,
            stats: self.stats,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_all(&mut self) -> Outcome<BTreeMap<DatasetId, Vec<Vec<Record>>>> {
        for region in 0..self.plan.regions.len() {
            self.drive(region, false).await?;
            self.completed.insert(region);
            self.release_consumed(region).await;
        }

        // los sinks también pueden perderse antes de leerlos
        let mut outputs = BTreeMap::new();
        for sink in self.plan.sinks() {
            if !self.available(sink).await {
                let region = self.region_of(sink)?;
                self.forget(sink);
                self.drive(region, true).await?;
            }
            let parts = self.read_dataset(sink).await?;
            self.stats.records_out += parts.iter().map(|p| p.len() as u64).sum::<u64>();
            outputs.insert(sink, parts);
        }

        // datasets memory que siguen vivos (sinks incluidos) ya no se necesitan
        for ds in self.plan.graph.datasets.values() {
            if ds.persistence == Persistence::Memory && !self.released.contains(&ds.id) {
                self.release(ds.id).await;
            }
        }
        Ok(outputs)
    }

    /// Corre `target` con una pila explícita: si le falta una entrada, se
    /// apila la región que la produce y se vuelve a evaluar el tope.
    async fn drive(&mut self, target: usize, recompute: bool) -> Outcome<()> {
        let mut stack = vec![target];
        let mut tries: HashMap<usize, u32> = HashMap::new();
        let mut last_failure: HashMap<usize, FlowFailure> = HashMap::new();

        while let Some(&region) = stack.last() {
            self.check_stop()?;

            let inputs = self.plan.regions[region].inputs.clone();
            let mut lost = Vec::new();
            for ds in inputs {
                if !self.available(ds).await {
                    lost.push(ds);
                }
            }
            if !lost.is_empty() {
                for ds in lost {
                    self.schedule_recompute(ds, &mut stack)?;
                }
                continue;
            }

            let n = tries.entry(region).or_insert(0);
            if *n >= self.config.max_task_attempts {
                return Err(last_failure.remove(&region).unwrap_or_else(|| {
                    failure(
                        &FlowError::TaskFailure {
                            task: format!("region-{region}"),
                            reason: "intentos agotados".to_string(),
                        },
                        None,
                        Some(self.plan.regions[region].root),
                    )
                }));
            }
            *n += 1;

            match self.run_once(region).await {
                Ok(()) => {
                    stack.pop();
                    if recompute || region != target {
                        self.stats.recomputed_regions += 1;
                    }
                }
                Err(f) if f.kind == ErrorKind::Cancelled => return Err(f),
                Err(f) => {
                    warn!(
                        "región {} falló ({:?} en {:?}): {}",
                        region, f.kind, f.task, f.message
                    );
                    last_failure.insert(region, f);
                    // un agente caído tarda un par de heartbeats en salir del broker
                    let n = tries.get(&region).copied().unwrap_or(1);
                    if n < self.config.max_task_attempts {
                        let mut stop = self.stop.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.region_retry_backoff * n) => {}
                            _ = cancelled(&mut stop) => {
                                return Err(failure(&FlowError::Cancelled, None, None))
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Apila la región productora de un dataset perdido, según la política.
    fn schedule_recompute(&mut self, ds: DatasetId, stack: &mut Vec<usize>) -> Outcome<()> {
        let persistence = self
            .plan
            .persistence_of(ds)
            .map_err(|e| failure(&e, None, Some(ds)))?;
        let mode = match persistence {
            Persistence::Memory => self.config.recompute.memory,
            Persistence::OnDisk => self.config.recompute.on_disk,
        };
        if mode == RecomputeMode::Fail {
            return Err(failure(
                &FlowError::NotFound(format!(
                    "el dataset {ds} ({persistence:?}) se perdió y la política no permite recomputarlo"
                )),
                None,
                Some(ds),
            ));
        }
        if let Some(max) = self.config.recompute.max_depth {
            if stack.len() as u32 > max {
                return Err(failure(
                    &FlowError::NotFound(format!(
                        "recomputar el dataset {ds} excede la profundidad máxima {max}"
                    )),
                    None,
                    Some(ds),
                ));
            }
        }

        let producer = self.region_of(ds)?;
        self.forget(ds);
        // si ya estaba apilada, sube al tope: tiene que correr antes
        stack.retain(|r| *r != producer);
        stack.push(producer);
        info!("dataset {} perdido: se recomputa la región {}", ds, producer);
        Ok(())
    }

    async fn run_once(&mut self, region: usize) -> Outcome<()> {
        let attempt = {
            let next = self.next_attempt.entry(region).or_insert(0);
            let a = *next;
            *next += 1;
            a
        };
        let plan = self.plan;
        let r = &plan.regions[region];

        let mut staged = BTreeMap::new();
        for ds in &r.inputs {
            for ((d, p), placement) in self.placements.range((*ds, 0)..=(*ds, PartitionId::MAX)) {
                staged.insert((*d, *p), placement.clone());
            }
        }

        let tasks = r
            .tasks
            .iter()
            .filter_map(|id| plan.task(id).cloned())
            .collect();

        let run = RegionRun {
            flow_id: self.flow_id.clone(),
            region,
            attempt,
            tasks,
            staged,
            timeout_ms: self.config.task_timeout.as_millis() as u64,
            shuffle: self.config.shuffle.clone(),
            stop: self.stop.clone(),
        };

        debug!("región {} (raíz d{}) intento {}", region, r.root, attempt);
        self.stats.region_runs += 1;
        let first = self.backend.run_region(&run).await;
        let result = match first {
            Err(f) if f.kind == ErrorKind::ResourceUnavailable && r.datasets.len() > 1 => {
                info!(
                    "región {}: {} tareas no entran juntas en el cluster, se corre por etapas persistidas",
                    region,
                    run.tasks.len()
                );
                self.run_in_stages(&r.datasets, run).await
            }
            other => other,
        };
        match result {
            Ok(done) => {
                for ((ds, p), agent_url) in done.placements {
                    if plan.delivery_of(ds) == Delivery::Staged {
                        self.placements.insert((ds, p), Placement { attempt, agent_url });
                    }
                }
                self.released.remove(&r.root);
                Ok(())
            }
            Err(f) => {
                self.stats.failed_runs += 1;
                Err(f)
            }
        }
    }

    /// Corre la región dataset por dataset, con cada entrega en streaming
    /// pasada a persistida. Los intermedios se liberan al terminar.
    async fn run_in_stages(
        &self,
        datasets: &[DatasetId],
        base: RegionRun,
    ) -> Outcome<RegionDone> {
        let mut staged = base.staged.clone();
        let mut interim: Vec<DatasetId> = Vec::new();
        let mut done = RegionDone::default();
        let mut result = Ok(());

        for tasks in staged_stages(datasets, &base.tasks) {
            if let Some(ds) = tasks.first().map(|t| t.dataset) {
                if self.plan.delivery_of(ds) == Delivery::Streamed {
                    interim.push(ds);
                }
            }
            let run = RegionRun {
                tasks,
                staged: staged.clone(),
                ..base.clone()
            };
            match self.backend.run_region(&run).await {
                Ok(part) => {
                    for ((ds, p), agent_url) in &part.placements {
                        staged.insert(
                            (*ds, *p),
                            Placement {
                                attempt: base.attempt,
                                agent_url: agent_url.clone(),
                            },
                        );
                    }
                    done.records_out += part.records_out;
                    done.placements.extend(part.placements);
                }
                Err(f) => {
                    result = Err(f);
                    break;
                }
            }
        }

        for ds in interim {
            let mut agents: Vec<String> = staged
                .range((ds, 0)..=(ds, PartitionId::MAX))
                .filter_map(|(_, p)| p.agent_url.clone())
                .collect();
            agents.sort();
            agents.dedup();
            self.backend.release_dataset(&self.flow_id, ds, agents).await;
        }
        result.map(|()| done)
    }

    /// Libera los datasets memory que la región leía si ya nadie más los
    /// va a leer.
    async fn release_consumed(&mut self, region: usize) {
        let inputs = self.plan.regions[region].inputs.clone();
        for ds in inputs {
            if self.plan.persistence_of(ds).ok() != Some(Persistence::Memory) {
                continue;
            }
            let consumers = self.plan.consuming_regions(ds);
            if consumers.iter().all(|r| self.completed.contains(r)) {
                self.release(ds).await;
            }
        }
    }

    async fn release(&mut self, ds: DatasetId) {
        let agents = self.agents_of(ds);
        debug!("liberando dataset {}", ds);
        self.backend.release_dataset(&self.flow_id, ds, agents).await;
        self.forget(ds);
        self.released.insert(ds);
    }

    fn agents_of(&self, ds: DatasetId) -> Vec<String> {
        let mut agents: Vec<String> = self
            .placements
            .range((ds, 0)..=(ds, PartitionId::MAX))
            .filter_map(|(_, p)| p.agent_url.clone())
            .collect();
        agents.sort();
        agents.dedup();
        agents
    }

    fn forget(&mut self, ds: DatasetId) {
        self.placements.retain(|(d, _), _| *d != ds);
    }

    fn partition_count(&self, ds: DatasetId) -> u32 {
        self.plan
            .graph
            .dataset(ds)
            .and_then(|d| d.partition_count())
            .unwrap_or(0)
    }

    /// Todas las particiones materializadas y todavía accesibles.
    async fn available(&self, ds: DatasetId) -> bool {
        for p in 0..self.partition_count(ds) {
            let Some(placement) = self.placements.get(&(ds, p)) else {
                return false;
            };
            if !self
                .backend
                .is_available(&self.flow_id, ds, p, placement)
                .await
            {
                return false;
            }
        }
        true
    }

    async fn read_dataset(&self, ds: DatasetId) -> Outcome<Vec<Vec<Record>>> {
        let mut parts = Vec::new();
        for p in 0..self.partition_count(ds) {
            let placement = self.placements.get(&(ds, p)).ok_or_else(|| {
                failure(
                    &FlowError::NotFound(format!("d{ds}-p{p} no está materializado")),
                    None,
                    Some(ds),
                )
            })?;
            let records = self
                .backend
                .read_partition(&self.flow_id, ds, p, placement)
                .await
                .map_err(|e| failure(&e, None, Some(ds)))?;
            parts.push(records);
        }
        Ok(parts)
    }

    fn region_of(&self, ds: DatasetId) -> Outcome<usize> {
        self.plan
            .region_of(ds)
            .ok_or_else(|| failure(&FlowError::UnknownDataset(ds), None, Some(ds)))
    }

    fn check_stop(&self) -> Outcome<()> {
        if *self.stop.borrow() {
            return Err(failure(&FlowError::Cancelled, None, None));
        }
        Ok(())
    }
}
