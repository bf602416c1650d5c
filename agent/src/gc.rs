use common::{shuffle::spill, DatasetId, Result};
use std::{
    path::Path,
    time::{Duration, Instant, SystemTime},
};
use tracing::{debug, info, warn};

use crate::state::{lock, AgentState};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcStats {
    pub datasets_removed: usize,
    pub temp_files_removed: usize,
    pub executors_forgotten: usize,
}

pub async fn run_gc_loop(state: AgentState) {
    loop {
        tokio::time::sleep(state.config.gc_interval).await;
        match gc_once(&state, SystemTime::now()).await {
            Ok(stats) if stats != GcStats::default() => info!("gc: {:?}", stats),
            Ok(_) => {}
            Err(e) => warn!("gc falló: {}", e),
        }
    }
}

/// Una pasada de limpieza:
/// - temporales de particiones cuyo flow ya no tiene executors corriendo
///   (escrituras abortadas o de executors muertos)
/// - datasets persistidos más viejos que la retención
/// - registros de executors terminados hace más que la retención
pub async fn gc_once(state: &AgentState, now: SystemTime) -> Result<GcStats> {
    let mut stats = GcStats::default();
    let retention = state.config.dataset_retention;
    let flows_root = state.config.storage_dir.join("flows");

    let mut flows = match tokio::fs::read_dir(&flows_root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            stats.executors_forgotten = forget_finished(state, retention);
            return Ok(stats);
        }
        Err(e) => return Err(e.into()),
    };

    while let Some(flow_entry) = flows.next_entry().await? {
        let flow_id = flow_entry.file_name().to_string_lossy().to_string();
        let flow_active = state.has_running_for_flow(&flow_id);

        let mut datasets = tokio::fs::read_dir(flow_entry.path()).await?;
        while let Some(ds_entry) = datasets.next_entry().await? {
            let name = ds_entry.file_name().to_string_lossy().to_string();
            let Some(dataset) = name.strip_prefix('d').and_then(|n| n.parse::<DatasetId>().ok())
            else {
                continue;
            };

            if !flow_active {
                stats.temp_files_removed += remove_temps(&ds_entry.path()).await?;
            }

            if !flow_active && older_than(&ds_entry.path(), now, retention).await {
                debug!("gc: dataset d{} del flow {} vencido", dataset, flow_id);
                lock(&state.locations).remove_dataset(&flow_id, dataset);
                if spill::remove_dataset(&state.config.storage_dir, &flow_id, dataset).await? {
                    stats.datasets_removed += 1;
                }
            }
        }

        // flow sin datasets: se borra el directorio vacío
        if !flow_active && is_empty_dir(&flow_entry.path()).await {
            let _ = tokio::fs::remove_dir(flow_entry.path()).await;
        }
    }

    stats.executors_forgotten = forget_finished(state, retention);
    Ok(stats)
}

async fn remove_temps(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().contains(".tmp-") {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn older_than(path: &Path, now: SystemTime, retention: Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    now.duration_since(modified).unwrap_or_default() > retention
}

async fn is_empty_dir(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut rd) => matches!(rd.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

fn forget_finished(state: &AgentState, retention: Duration) -> usize {
    let mut executors = lock(&state.executors);
    let before = executors.len();
    executors.retain(|_, r| match r.finished_at {
        Some(t) => Instant::now().saturating_duration_since(t) <= retention,
        None => true,
    });
    before - executors.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ProcessLauncher;
    use crate::state::ExecutorRecord;
    use common::{shuffle::SpillWriter, AgentConfig, ExecutorHandle, Resource, TaskState};
    use std::{env, path::PathBuf, sync::Arc};

    fn temp_dir(sub: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("flow-gc-{}-{}", sub, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn agent_state(storage: PathBuf, retention: Duration) -> AgentState {
        let config = AgentConfig {
            storage_dir: storage,
            dataset_retention: retention,
            ..AgentConfig::default()
        };
        AgentState::new(
            config,
            "http://127.0.0.1:1".to_string(),
            "127.0.0.1:2".to_string(),
            "127.0.0.1".to_string(),
            Arc::new(ProcessLauncher::new(PathBuf::from("flow-executor"))),
        )
    }

    fn record(flow_id: &str, state: TaskState, finished_at: Option<Instant>) -> ExecutorRecord {
        ExecutorRecord {
            handle: ExecutorHandle {
                executor_id: uuid::Uuid::new_v4().to_string(),
                agent_id: "a".to_string(),
                agent_url: "http://127.0.0.1:1".to_string(),
                task_id: "d0-p0".to_string(),
                attempt: 0,
                pid: None,
            },
            flow_id: flow_id.to_string(),
            resources: Resource::new(1, 64, 0),
            state,
            report: None,
            error: None,
            started_at: Instant::now(),
            finished_at,
            stop: None,
        }
    }

    async fn committed(root: &Path, flow: &str, dataset: DatasetId) {
        let mut w = SpillWriter::create(root, flow, dataset, 0, 0).await.unwrap();
        w.write(b"x").await.unwrap();
        w.commit().await.unwrap();
    }

    /// Temporal de una escritura que nunca llegó al commit.
    fn orphan_temp(root: &Path, flow: &str, dataset: DatasetId) -> PathBuf {
        let dir = root.join("flows").join(flow).join(format!("d{dataset}"));
        std::fs::create_dir_all(&dir).unwrap();
        let tmp = dir.join("part-1.frames.tmp-3");
        std::fs::write(&tmp, b"parcial").unwrap();
        tmp
    }

    #[tokio::test]
    async fn temporales_huerfanos_se_borran_y_los_datasets_esperan_la_retencion() {
        let root = temp_dir("retention");
        let st = agent_state(root.clone(), Duration::from_secs(60));
        committed(&root, "f1", 0).await;
        let tmp = orphan_temp(&root, "f1", 0);

        let stats = gc_once(&st, SystemTime::now()).await.unwrap();
        assert_eq!(stats.temp_files_removed, 1);
        assert_eq!(stats.datasets_removed, 0);
        assert!(!tmp.exists());
        assert!(spill::partition_exists(&root, "f1", 0, 0).await);

        // dos minutos después el dataset ya venció
        let later = SystemTime::now() + Duration::from_secs(120);
        let stats = gc_once(&st, later).await.unwrap();
        assert_eq!(stats.datasets_removed, 1);
        assert!(!spill::partition_exists(&root, "f1", 0, 0).await);
        assert!(!root.join("flows").join("f1").exists());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn flow_con_executors_corriendo_no_se_toca() {
        let root = temp_dir("active");
        let st = agent_state(root.clone(), Duration::from_secs(60));
        committed(&root, "f2", 4).await;
        let tmp = orphan_temp(&root, "f2", 4);
        lock(&st.executors).insert("e1".to_string(), record("f2", TaskState::Running, None));

        let later = SystemTime::now() + Duration::from_secs(3_600);
        let stats = gc_once(&st, later).await.unwrap();
        assert_eq!(stats, GcStats::default());
        assert!(tmp.exists());
        assert!(spill::partition_exists(&root, "f2", 4, 0).await);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn executors_terminados_se_olvidan_tras_la_retencion() {
        let root = temp_dir("forget");
        let st = agent_state(root.clone(), Duration::from_millis(200));
        {
            let mut executors = lock(&st.executors);
            executors.insert(
                "viejo".to_string(),
                record("f3", TaskState::Succeeded, Some(Instant::now())),
            );
            executors.insert("vivo".to_string(), record("f3", TaskState::Running, None));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        lock(&st.executors).insert(
            "reciente".to_string(),
            record("f3", TaskState::Failed, Some(Instant::now())),
        );

        // sin directorio de flows: sólo se limpian los registros
        let stats = gc_once(&st, SystemTime::now()).await.unwrap();
        assert_eq!(stats.executors_forgotten, 1);
        let mut left: Vec<String> = lock(&st.executors).keys().cloned().collect();
        left.sort();
        assert_eq!(left, vec!["reciente".to_string(), "vivo".to_string()]);
        let _ = std::fs::remove_dir_all(root);
    }
}
