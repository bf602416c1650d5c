use async_trait::async_trait;
use common::{ErrorBody, ExecutorId, FlowError, Result, TaskAssignment, TaskReport};
use std::{path::PathBuf, process::Stdio};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Prefijo de la línea de stdout con el reporte final del executor.
pub const REPORT_PREFIX: &str = "FLOW_REPORT ";
/// Prefijo de la línea de stderr con el error que hizo fallar al executor.
pub const ERROR_PREFIX: &str = "FLOW_ERROR ";

/// Lo que el agente le pasa a un executor nuevo.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executor_id: ExecutorId,
    pub assignment: TaskAssignment,
    pub agent_url: String,
    /// Host donde el executor abre su propio plano de datos.
    pub data_host: String,
    /// Plano de datos del agente (particiones persistidas).
    pub agent_data_addr: String,
    pub storage_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessExit {
    pub success: bool,
    pub code: Option<i32>,
    pub report: Option<TaskReport>,
    pub error: Option<ErrorBody>,
}

/// Un executor en marcha.
#[async_trait]
pub trait ExecutorProcess: Send {
    fn pid(&self) -> Option<u32>;

    async fn wait(&mut self) -> Result<ProcessExit>;

    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ExecutorLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn ExecutorProcess>>;
}

/* =========================
   Procesos del sistema
   ========================= */

/// Lanza el binario `flow-executor`, un proceso por tarea.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    bin: PathBuf,
}

impl ProcessLauncher {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }
}

#[async_trait]
impl ExecutorLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn ExecutorProcess>> {
        // la asignación viaja en un archivo: puede ser grande (fuentes inline)
        let dir = spec.storage_dir.join("executors");
        tokio::fs::create_dir_all(&dir).await?;
        let assignment_path = dir.join(format!("{}.json", spec.executor_id));
        tokio::fs::write(&assignment_path, serde_json::to_vec(&spec.assignment)?).await?;

        let mut child = Command::new(&self.bin)
            .env("FLOW_ASSIGNMENT", &assignment_path)
            .env("FLOW_EXECUTOR_ID", &spec.executor_id)
            .env("FLOW_AGENT_URL", &spec.agent_url)
            .env("FLOW_AGENT_DATA_ADDR", &spec.agent_data_addr)
            .env("FLOW_DATA_HOST", &spec.data_host)
            .env("FLOW_STORAGE_DIR", &spec.storage_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FlowError::TaskFailure {
                    task: spec.assignment.spec.id.clone(),
                    reason: format!("no se pudo lanzar {:?}: {e}", self.bin),
                }
            })?;

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(async move {
                let mut report = None;
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(json) = line.strip_prefix(REPORT_PREFIX) {
                        match serde_json::from_str::<TaskReport>(json) {
                            Ok(r) => report = Some(r),
                            Err(e) => warn!("reporte de executor ilegible: {}", e),
                        }
                    }
                }
                report
            })
        });

        let executor_id = spec.executor_id.clone();
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(async move {
                let mut error = None;
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(json) = line.strip_prefix(ERROR_PREFIX) {
                        error = serde_json::from_str::<ErrorBody>(json).ok();
                    } else {
                        debug!("[executor {}] {}", executor_id, line);
                    }
                }
                error
            })
        });

        Ok(Box::new(ChildProcess {
            child,
            assignment_path,
            stdout,
            stderr,
        }))
    }
}

struct ChildProcess {
    child: Child,
    assignment_path: PathBuf,
    stdout: Option<JoinHandle<Option<TaskReport>>>,
    stderr: Option<JoinHandle<Option<ErrorBody>>>,
}

#[async_trait]
impl ExecutorProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        let status = self.child.wait().await?;
        let report = match self.stdout.take() {
            Some(h) => h.await.ok().flatten(),
            None => None,
        };
        let error = match self.stderr.take() {
            Some(h) => h.await.ok().flatten(),
            None => None,
        };
        let _ = tokio::fs::remove_file(&self.assignment_path).await;

        Ok(ProcessExit {
            success: status.success(),
            code: status.code(),
            report,
            error,
        })
    }

    async fn kill(&mut self) -> Result<()> {
        // si ya terminó, start_kill falla; no es error
        if let Err(e) = self.child.start_kill() {
            debug!("kill sobre executor ya terminado: {}", e);
        }
        Ok(())
    }
}
