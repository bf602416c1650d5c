use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::error::{FlowError, Result};
use crate::resource::Resource;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;
const DEFAULT_DEAD_AFTER_MISSED: u32 = 3;
const DEFAULT_EVICT_AFTER_MISSED: u32 = 10;

const DEFAULT_AGENT_SLOTS: u32 = 4;
const DEFAULT_AGENT_MEMORY_MB: u64 = 4_096;
const DEFAULT_AGENT_DISK_MB: u64 = 10_240;
const DEFAULT_GC_INTERVAL_MS: u64 = 10_000;
const DEFAULT_RETENTION_SECS: u64 = 3_600;

const DEFAULT_MAX_TASK_ATTEMPTS: u32 = 3;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Lee una variable de entorno y la parsea; si no existe o no parsea, usa el default.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/* =========================
   Broker
   ========================= */

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: String,
    pub heartbeat_interval: Duration,
    /// Múltiplo del intervalo de heartbeat tras el cual un agente se marca muerto.
    pub dead_after_missed: u32,
    /// Múltiplo tras el cual el registro se elimina por completo.
    pub evict_after_missed: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            dead_after_missed: DEFAULT_DEAD_AFTER_MISSED,
            evict_after_missed: DEFAULT_EVICT_AFTER_MISSED,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_string("BROKER_ADDR", &d.bind_addr),
            heartbeat_interval: Duration::from_millis(env_or(
                "HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )),
            dead_after_missed: env_or("AGENT_DEAD_AFTER_MISSED", d.dead_after_missed).max(1),
            evict_after_missed: env_or("AGENT_EVICT_AFTER_MISSED", d.evict_after_missed).max(1),
        }
    }

    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval * self.dead_after_missed
    }

    pub fn evict_after(&self) -> Duration {
        self.heartbeat_interval * self.evict_after_missed.max(self.dead_after_missed)
    }
}

/* =========================
   Agent
   ========================= */

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Dirección donde escucha la API HTTP del agente.
    pub bind_addr: String,
    /// URL anunciada al broker; si falta se deriva de la dirección real.
    pub url: Option<String>,
    /// Dirección del servidor de particiones persistidas.
    pub data_bind_addr: String,
    pub broker_url: String,
    pub storage_dir: PathBuf,
    pub capacity: Resource,
    pub heartbeat_interval: Duration,
    pub gc_interval: Duration,
    pub dataset_retention: Duration,
    pub executor_bin: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_string(),
            url: None,
            data_bind_addr: "0.0.0.0:0".to_string(),
            broker_url: "http://localhost:8080".to_string(),
            storage_dir: env::temp_dir().join("flow-agent"),
            capacity: Resource::new(
                DEFAULT_AGENT_SLOTS,
                DEFAULT_AGENT_MEMORY_MB,
                DEFAULT_AGENT_DISK_MB,
            ),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            gc_interval: Duration::from_millis(DEFAULT_GC_INTERVAL_MS),
            dataset_retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            executor_bin: PathBuf::from("flow-executor"),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_string("AGENT_ADDR", &d.bind_addr),
            url: env::var("AGENT_URL").ok(),
            data_bind_addr: env_string("AGENT_DATA_ADDR", &d.data_bind_addr),
            broker_url: env_string("BROKER_URL", &d.broker_url),
            storage_dir: env::var("AGENT_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.storage_dir),
            capacity: Resource::new(
                env_or("AGENT_SLOTS", d.capacity.slots),
                env_or("AGENT_MEMORY_MB", d.capacity.memory_mb),
                env_or("AGENT_DISK_MB", d.capacity.disk_mb),
            ),
            heartbeat_interval: Duration::from_millis(env_or(
                "HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )),
            gc_interval: Duration::from_millis(env_or(
                "AGENT_GC_INTERVAL_MS",
                DEFAULT_GC_INTERVAL_MS,
            )),
            dataset_retention: Duration::from_secs(env_or(
                "DATASET_RETENTION_SECS",
                DEFAULT_RETENTION_SECS,
            )),
            executor_bin: env::var("FLOW_EXECUTOR_BIN")
                .map(PathBuf::from)
                .unwrap_or(d.executor_bin),
        }
    }
}

/* =========================
   Shuffle
   ========================= */

/// Parámetros del plano de datos. Viajan dentro de cada asignación de tarea
/// para que el executor no dependa de su propio entorno.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleConfig {
    /// Cota del buffer por par (partición productora, consumidor), en registros.
    pub buffer_records: usize,
    /// Reintentos de lectura para entradas persistidas.
    pub input_retries: u32,
    pub retry_backoff_ms: u64,
    /// Tiempo máximo esperando a que el productor abra su salida.
    pub attach_timeout_ms: u64,
    /// Con el buffer ya leído, tiempo máximo que el productor espera a que el
    /// consumidor lo suelte.
    pub linger_timeout_ms: u64,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            buffer_records: 1_024,
            input_retries: 3,
            retry_backoff_ms: 200,
            attach_timeout_ms: 30_000,
            linger_timeout_ms: 30_000,
        }
    }
}

impl ShuffleConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            buffer_records: env_or("SHUFFLE_BUFFER_RECORDS", d.buffer_records).max(1),
            input_retries: env_or("SHUFFLE_INPUT_RETRIES", d.input_retries),
            retry_backoff_ms: env_or("SHUFFLE_RETRY_BACKOFF_MS", d.retry_backoff_ms),
            attach_timeout_ms: env_or("SHUFFLE_ATTACH_TIMEOUT_MS", d.attach_timeout_ms),
            linger_timeout_ms: env_or("SHUFFLE_LINGER_TIMEOUT_MS", d.linger_timeout_ms),
        }
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn linger_timeout(&self) -> Duration {
        Duration::from_millis(self.linger_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/* =========================
   Planner y política de recómputo
   ========================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Requerimiento por tarea cuando el step no declara uno propio.
    pub default_task_resource: Resource,
    pub fuse: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_task_resource: Resource::new(1, 256, 0),
            fuse: true,
        }
    }
}

impl PlannerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_task_resource: Resource::new(
                env_or("TASK_SLOTS", d.default_task_resource.slots).max(1),
                env_or("TASK_MEMORY_MB", d.default_task_resource.memory_mb),
                env_or("TASK_DISK_MB", d.default_task_resource.disk_mb),
            ),
            fuse: env_or("PLANNER_FUSE", d.fuse),
        }
    }
}

/// Qué hacer cuando falta un dataset que una región necesita.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecomputeMode {
    Recompute,
    Fail,
}

impl FromStr for RecomputeMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recompute" => Ok(RecomputeMode::Recompute),
            "fail" => Ok(RecomputeMode::Fail),
            other => Err(FlowError::InvalidConfig(format!(
                "modo de recómputo desconocido: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecomputePolicy {
    /// Datasets `memory` perdidos.
    pub memory: RecomputeMode,
    /// Datasets `on-disk` perdidos (por ejemplo, agente caído).
    pub on_disk: RecomputeMode,
    /// Profundidad máxima de la cadena de recómputo; `None` = sin límite.
    pub max_depth: Option<u32>,
}

impl Default for RecomputePolicy {
    fn default() -> Self {
        Self {
            memory: RecomputeMode::Recompute,
            on_disk: RecomputeMode::Recompute,
            max_depth: None,
        }
    }
}

/* =========================
   Ejecución de flujos
   ========================= */

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_task_attempts: u32,
    pub task_timeout: Duration,
    pub recompute: RecomputePolicy,
    pub allocation_retries: u32,
    pub allocation_backoff: Duration,
    /// Espera base entre intentos de una región que falló; crece con cada intento.
    pub region_retry_backoff: Duration,
    pub poll_interval: Duration,
    /// Raíz de los spills en ejecución local.
    pub spill_dir: PathBuf,
    pub planner: PlannerConfig,
    pub shuffle: ShuffleConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_task_attempts: DEFAULT_MAX_TASK_ATTEMPTS,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            recompute: RecomputePolicy::default(),
            allocation_retries: 5,
            allocation_backoff: Duration::from_millis(500),
            region_retry_backoff: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            spill_dir: env::temp_dir().join("flow-spill"),
            planner: PlannerConfig::default(),
            shuffle: ShuffleConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let mut recompute = d.recompute;
        if let Ok(v) = env::var("RECOMPUTE_MEMORY") {
            recompute.memory = v.parse()?;
        }
        if let Ok(v) = env::var("RECOMPUTE_ON_DISK") {
            recompute.on_disk = v.parse()?;
        }
        recompute.max_depth = env::var("RECOMPUTE_MAX_DEPTH")
            .ok()
            .and_then(|s| s.parse::<u32>().ok());

        let cfg = Self {
            max_task_attempts: env_or("MAX_TASK_ATTEMPTS", d.max_task_attempts),
            task_timeout: Duration::from_secs(env_or(
                "TASK_TIMEOUT_SECS",
                DEFAULT_TASK_TIMEOUT_SECS,
            )),
            recompute,
            allocation_retries: env_or("ALLOCATION_RETRIES", d.allocation_retries),
            allocation_backoff: Duration::from_millis(env_or("ALLOCATION_BACKOFF_MS", 500)),
            region_retry_backoff: Duration::from_millis(env_or("REGION_RETRY_BACKOFF_MS", 500)),
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 100)),
            spill_dir: env::var("FLOW_SPILL_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.spill_dir),
            planner: PlannerConfig::from_env(),
            shuffle: ShuffleConfig::from_env(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_task_attempts == 0 {
            return Err(FlowError::InvalidConfig(
                "MAX_TASK_ATTEMPTS debe ser >= 1".to_string(),
            ));
        }
        if self.shuffle.buffer_records == 0 {
            return Err(FlowError::InvalidConfig(
                "SHUFFLE_BUFFER_RECORDS debe ser >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recompute_mode_parsea_valores_conocidos() {
        assert_eq!("recompute".parse::<RecomputeMode>().unwrap(), RecomputeMode::Recompute);
        assert_eq!(" FAIL ".parse::<RecomputeMode>().unwrap(), RecomputeMode::Fail);
        assert!("maybe".parse::<RecomputeMode>().is_err());
    }

    #[test]
    fn broker_timeouts_son_multiplos_del_heartbeat() {
        let cfg = BrokerConfig {
            heartbeat_interval: Duration::from_millis(100),
            dead_after_missed: 3,
            evict_after_missed: 10,
            ..BrokerConfig::default()
        };
        assert_eq!(cfg.dead_after(), Duration::from_millis(300));
        assert_eq!(cfg.evict_after(), Duration::from_secs(1));
    }

    #[test]
    fn validate_rechaza_cero_intentos() {
        let cfg = RunConfig {
            max_task_attempts: 0,
            ..RunConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(FlowError::InvalidConfig(_))));
    }
}
