use chrono::{DateTime, Utc};
use common::{
    AgentId, AgentInfo, AgentRegisterRequest, AgentRegisterResponse, Allocation,
    AllocationRequest, AllocationResponse, BrokerConfig, FlowError, HeartbeatRequest,
    ReleaseRequest, Resource, Result,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::{Duration, Instant},
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<BrokerConfig>,
}

impl AppState {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config: Arc::new(config),
        }
    }
}

/// Vista del broker de un agente registrado.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub agent_id: AgentId,
    pub address: String,
    pub data_addr: String,
    pub hostname: String,
    pub capacity: Resource,
    /// Reservado por asignaciones todavía no liberadas.
    pub reserved: Resource,
    pub running_executors: u32,
    pub observed_memory_mb: u64,
    pub cpu_percent: f32,
    pub last_heartbeat: Instant,
    pub last_used: Instant,
    pub registered_at: DateTime<Utc>,
    pub dead: bool,
}

impl AgentEntry {
    pub fn free(&self) -> Resource {
        self.capacity.saturating_sub(&self.reserved)
    }

    fn info(&self, now: Instant) -> AgentInfo {
        AgentInfo {
            agent_id: self.agent_id.clone(),
            address: self.address.clone(),
            data_addr: self.data_addr.clone(),
            hostname: self.hostname.clone(),
            dead: self.dead,
            last_heartbeat_secs_ago: now.saturating_duration_since(self.last_heartbeat).as_secs(),
            capacity: self.capacity,
            reserved: self.reserved,
            free: self.free(),
            running_executors: self.running_executors,
            observed_memory_mb: self.observed_memory_mb,
            cpu_percent: self.cpu_percent,
            registered_at: self.registered_at,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    pub newly_dead: Vec<AgentId>,
    pub evicted: Vec<AgentId>,
}

/// Tabla de agentes. El mapa sólo se bloquea para escribir al registrar o
/// desalojar; heartbeats y asignaciones bloquean cada entrada por separado.
#[derive(Debug, Default)]
pub struct Registry {
    agents: RwLock<HashMap<AgentId, Arc<Mutex<AgentEntry>>>>,
}

fn entry_lock(e: &Mutex<AgentEntry>) -> MutexGuard<'_, AgentEntry> {
    e.lock().unwrap_or_else(|p| p.into_inner())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<AgentEntry>>> {
        let map = self.agents.read().unwrap_or_else(|p| p.into_inner());
        map.values().cloned().collect()
    }

    fn entry(&self, agent_id: &str) -> Result<Arc<Mutex<AgentEntry>>> {
        let map = self.agents.read().unwrap_or_else(|p| p.into_inner());
        map.get(agent_id)
            .cloned()
            .ok_or_else(|| FlowError::UnknownAgent(agent_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registra un agente. Si ya había uno con la misma dirección (agente
    /// reiniciado), la entrada vieja se reemplaza.
    pub fn register(
        &self,
        req: AgentRegisterRequest,
        heartbeat_interval: Duration,
    ) -> AgentRegisterResponse {
        let agent_id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let entry = AgentEntry {
            agent_id: agent_id.clone(),
            address: req.address.clone(),
            data_addr: req.data_addr,
            hostname: req.hostname,
            capacity: req.resource.capacity,
            reserved: Resource::default(),
            running_executors: req.resource.running_executors,
            observed_memory_mb: req.resource.observed_memory_mb,
            cpu_percent: req.resource.cpu_percent,
            last_heartbeat: now,
            last_used: now,
            registered_at: Utc::now(),
            dead: false,
        };

        {
            let mut map = self.agents.write().unwrap_or_else(|p| p.into_inner());
            let stale: Vec<AgentId> = map
                .iter()
                .filter(|(_, e)| entry_lock(e).address == req.address)
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                warn!("agente en {} se re-registró; descartando registro {}", req.address, id);
                map.remove(&id);
            }
            map.insert(agent_id.clone(), Arc::new(Mutex::new(entry)));
        }

        info!(
            "agente registrado: {} en {} (capacidad {})",
            agent_id, req.address, req.resource.capacity
        );
        AgentRegisterResponse {
            agent_id,
            heartbeat_interval_ms: heartbeat_interval.as_millis() as u64,
        }
    }

    pub fn heartbeat(&self, req: &HeartbeatRequest) -> Result<()> {
        let entry = self.entry(&req.agent_id)?;
        let mut e = entry_lock(&entry);
        e.last_heartbeat = Instant::now();
        e.capacity = req.resource.capacity;
        e.running_executors = req.resource.running_executors;
        e.observed_memory_mb = req.resource.observed_memory_mb;
        e.cpu_percent = req.resource.cpu_percent;
        if e.dead {
            info!("agente {} volvió a dar heartbeat, marcado vivo", e.agent_id);
            e.dead = false;
        }
        Ok(())
    }

    /// Reserva hasta `count` unidades de `resource`, de a una: cada unidad va
    /// al agente vivo con más capacidad libre; en empate, al que lleva más
    /// tiempo sin usarse. Un mismo agente puede recibir varias unidades.
    pub fn allocate(&self, req: &AllocationRequest) -> Result<AllocationResponse> {
        let mut allocations = Vec::new();

        for _ in 0..req.count {
            let Some(allocation) = self.allocate_one(&req.resource) else {
                break;
            };
            allocations.push(allocation);
        }

        if allocations.is_empty() && req.count > 0 {
            return Err(FlowError::ResourceUnavailable {
                requested: req.count,
                granted: 0,
            });
        }
        if (allocations.len() as u32) < req.count {
            info!(
                "asignación parcial: {}/{} unidades de {}",
                allocations.len(),
                req.count,
                req.resource
            );
        }

        Ok(AllocationResponse {
            allocations,
            resource: req.resource,
        })
    }

    fn allocate_one(&self, resource: &Resource) -> Option<Allocation> {
        loop {
            let mut candidates: Vec<(Arc<Mutex<AgentEntry>>, (u32, u64, u64), Instant, AgentId)> =
                self.snapshot()
                    .into_iter()
                    .filter_map(|entry| {
                        let (key, last_used, id) = {
                            let e = entry_lock(&entry);
                            if e.dead || !e.free().fits(resource) {
                                return None;
                            }
                            (e.free().capacity_key(), e.last_used, e.agent_id.clone())
                        };
                        Some((entry, key, last_used, id))
                    })
                    .collect();

            if candidates.is_empty() {
                return None;
            }
            candidates.sort_by(|a, b| {
                b.1.cmp(&a.1)
                    .then_with(|| a.2.cmp(&b.2))
                    .then_with(|| a.3.cmp(&b.3))
            });

            let (entry, ..) = candidates.swap_remove(0);
            let mut e = entry_lock(&entry);
            // otra asignación concurrente pudo tomar la capacidad
            if e.dead || !e.free().fits(resource) {
                continue;
            }
            e.reserved = e.reserved.saturating_add(resource);
            e.last_used = Instant::now();
            return Some(Allocation {
                agent_id: e.agent_id.clone(),
                address: e.address.clone(),
                data_addr: e.data_addr.clone(),
            });
        }
    }

    pub fn release(&self, req: &ReleaseRequest) -> Result<()> {
        let entry = self.entry(&req.agent_id)?;
        let mut e = entry_lock(&entry);
        e.reserved = e.reserved.saturating_sub(&req.resource);
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentInfo> {
        let entry = self.entry(agent_id)?;
        let e = entry_lock(&entry);
        Ok(e.info(Instant::now()))
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        let now = Instant::now();
        let mut out: Vec<AgentInfo> = self
            .snapshot()
            .iter()
            .map(|entry| entry_lock(entry).info(now))
            .collect();
        out.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        out
    }

    /// Marca muertos a los agentes sin heartbeat por `dead_after` y elimina
    /// los que llevan `evict_after` sin contacto.
    pub fn sweep(&self, now: Instant, dead_after: Duration, evict_after: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for entry in self.snapshot() {
            let mut e = entry_lock(&entry);
            let silent = now.saturating_duration_since(e.last_heartbeat);
            if silent > evict_after {
                outcome.evicted.push(e.agent_id.clone());
            } else if !e.dead && silent > dead_after {
                e.dead = true;
                outcome.newly_dead.push(e.agent_id.clone());
            }
        }

        if !outcome.evicted.is_empty() {
            let mut map = self.agents.write().unwrap_or_else(|p| p.into_inner());
            for id in &outcome.evicted {
                map.remove(id);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ResourceReport;

    fn register(r: &Registry, addr: &str, slots: u32) -> AgentId {
        r.register(
            AgentRegisterRequest {
                address: addr.to_string(),
                data_addr: format!("{addr}-data"),
                hostname: "h".to_string(),
                resource: ResourceReport::idle(Resource::new(slots, 1024, 0)),
            },
            Duration::from_secs(1),
        )
        .agent_id
    }

    fn unit() -> Resource {
        Resource::new(1, 100, 0)
    }

    #[test]
    fn asigna_al_de_mas_capacidad_libre() {
        let r = Registry::new();
        let small = register(&r, "http://a", 1);
        let big = register(&r, "http://b", 4);

        let resp = r
            .allocate(&AllocationRequest {
                resource: unit(),
                count: 1,
            })
            .unwrap();
        assert_eq!(resp.allocations[0].agent_id, big);
        assert_eq!(r.get(&big).unwrap().free.slots, 3);
        assert_eq!(r.get(&small).unwrap().free.slots, 1);
    }

    #[test]
    fn empate_va_al_menos_usado_recientemente() {
        let r = Registry::new();
        let a = register(&r, "http://a", 2);
        let b = register(&r, "http://b", 2);

        let first = r
            .allocate(&AllocationRequest {
                resource: unit(),
                count: 1,
            })
            .unwrap()
            .allocations[0]
            .agent_id
            .clone();
        // el otro agente ahora tiene más libre
        let second = r
            .allocate(&AllocationRequest {
                resource: unit(),
                count: 1,
            })
            .unwrap()
            .allocations[0]
            .agent_id
            .clone();
        assert_ne!(first, second);
        // empate de nuevo (1 libre cada uno): gana el que se usó hace más
        let third = r
            .allocate(&AllocationRequest {
                resource: unit(),
                count: 1,
            })
            .unwrap()
            .allocations[0]
            .agent_id
            .clone();
        assert_eq!(third, first);
        assert!([a, b].contains(&third));
    }

    #[test]
    fn asignacion_parcial_y_flota_sin_capacidad() {
        let r = Registry::new();
        register(&r, "http://a", 2);

        let resp = r
            .allocate(&AllocationRequest {
                resource: unit(),
                count: 5,
            })
            .unwrap();
        assert_eq!(resp.allocations.len(), 2);

        let err = r
            .allocate(&AllocationRequest {
                resource: unit(),
                count: 1,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::ResourceUnavailable {
                requested: 1,
                granted: 0
            }
        ));
    }

    #[test]
    fn release_devuelve_capacidad() {
        let r = Registry::new();
        let a = register(&r, "http://a", 1);
        r.allocate(&AllocationRequest {
            resource: unit(),
            count: 1,
        })
        .unwrap();
        assert_eq!(r.get(&a).unwrap().free.slots, 0);

        r.release(&ReleaseRequest {
            agent_id: a.clone(),
            resource: unit(),
        })
        .unwrap();
        assert_eq!(r.get(&a).unwrap().free.slots, 1);

        assert!(matches!(
            r.release(&ReleaseRequest {
                agent_id: "nope".to_string(),
                resource: unit(),
            }),
            Err(FlowError::UnknownAgent(_))
        ));
    }

    #[test]
    fn heartbeat_de_agente_desconocido_falla() {
        let r = Registry::new();
        let err = r
            .heartbeat(&HeartbeatRequest {
                agent_id: "x".to_string(),
                resource: ResourceReport::idle(unit()),
            })
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownAgent(_)));
    }

    #[test]
    fn sweep_marca_muertos_revive_y_desaloja() {
        let r = Registry::new();
        let a = register(&r, "http://a", 1);

        let later = Instant::now() + Duration::from_secs(10);
        let out = r.sweep(later, Duration::from_secs(3), Duration::from_secs(30));
        assert_eq!(out.newly_dead, vec![a.clone()]);
        assert!(r.get(&a).unwrap().dead);

        // muerto: no recibe asignaciones
        assert!(r
            .allocate(&AllocationRequest {
                resource: unit(),
                count: 1
            })
            .is_err());

        // un heartbeat lo revive
        r.heartbeat(&HeartbeatRequest {
            agent_id: a.clone(),
            resource: ResourceReport::idle(Resource::new(1, 1024, 0)),
        })
        .unwrap();
        assert!(!r.get(&a).unwrap().dead);

        let much_later = Instant::now() + Duration::from_secs(60);
        let out = r.sweep(much_later, Duration::from_secs(3), Duration::from_secs(30));
        assert_eq!(out.evicted, vec![a.clone()]);
        assert!(r.is_empty());
    }

    #[test]
    fn re_registro_reemplaza_la_entrada_vieja() {
        let r = Registry::new();
        let old = register(&r, "http://a", 1);
        let new = register(&r, "http://a", 1);
        assert_ne!(old, new);
        assert_eq!(r.len(), 1);
        assert!(r.get(&old).is_err());
    }
}
