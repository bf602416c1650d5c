use async_trait::async_trait;
use common::{
    frame::PullRequest,
    rpc::AgentClient,
    shuffle::{open_remote, ExchangeHub, PartitionReader, Transport},
    Delivery, ErrorKind, ExecutorId, FlowError, PartitionId, Result, ShuffleDescriptor,
    TaskAssignment,
};
use common::task::TaskInput;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::debug;

const LOOKUP_POLL: Duration = Duration::from_millis(50);

/// Transporte de un executor dentro de un agente: las ubicaciones se publican
/// en el agente propio y se consultan en el agente productor; los datos
/// viajan por TCP.
pub struct RemoteTransport {
    hub: Arc<ExchangeHub>,
    spill_root: PathBuf,
    executor_id: ExecutorId,
    agent_url: String,
    agent_data_addr: String,
    /// Plano de datos de este executor (salidas en streaming).
    own_data_addr: String,
    client: AgentClient,
}

impl RemoteTransport {
    pub fn new(
        hub: Arc<ExchangeHub>,
        spill_root: PathBuf,
        executor_id: ExecutorId,
        agent_url: String,
        agent_data_addr: String,
        own_data_addr: String,
    ) -> Self {
        Self {
            hub,
            spill_root,
            executor_id,
            agent_url,
            agent_data_addr,
            own_data_addr,
            client: AgentClient::new(),
        }
    }

    /// Busca la ubicación del intento esperado. Para entradas en streaming
    /// el productor puede no haber anunciado todavía: se reintenta hasta el
    /// timeout de conexión.
    async fn locate(
        &self,
        assignment: &TaskAssignment,
        input: &TaskInput,
        partition: PartitionId,
    ) -> Result<ShuffleDescriptor> {
        let binding = assignment.binding(input.dataset, partition).ok_or_else(|| {
            FlowError::Protocol(format!(
                "la tarea {} no tiene binding para d{}-p{}",
                assignment.spec.id, input.dataset, partition
            ))
        })?;
        let agent = binding.agent_url.as_deref().ok_or_else(|| {
            FlowError::Protocol(format!(
                "binding de d{}-p{} sin agente",
                input.dataset, partition
            ))
        })?;

        let deadline = tokio::time::Instant::now() + assignment.shuffle.attach_timeout();
        loop {
            let found = self
                .client
                .lookup_location(agent, &assignment.flow_id, input.dataset, partition)
                .await?;
            match found {
                Some(desc) if desc.attempt == binding.attempt => return Ok(desc),
                Some(desc) if input.delivery == Delivery::Staged => {
                    return Err(FlowError::NotFound(format!(
                        "d{}-p{}: el agente tiene el intento {}, se esperaba {}",
                        input.dataset, partition, desc.attempt, binding.attempt
                    )))
                }
                None if input.delivery == Delivery::Staged => {
                    return Err(FlowError::NotFound(format!(
                        "d{}-p{} no está en {}",
                        input.dataset, partition, agent
                    )))
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FlowError::shuffle(
                    input.dataset,
                    partition,
                    "el productor no anunció su salida a tiempo",
                ));
            }
            tokio::time::sleep(LOOKUP_POLL).await;
        }
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    fn hub(&self) -> &Arc<ExchangeHub> {
        &self.hub
    }

    fn spill_root(&self) -> &Path {
        &self.spill_root
    }

    async fn open_input(
        &self,
        assignment: &TaskAssignment,
        input: &TaskInput,
        partition: PartitionId,
    ) -> Result<Box<dyn PartitionReader>> {
        let desc = self.locate(assignment, input, partition).await?;
        debug!(
            "leyendo d{}-p{} desde {} ({})",
            desc.dataset,
            desc.partition,
            desc.data_addr,
            if desc.staged { "disco" } else { "streaming" }
        );
        let reader = open_remote(
            &desc.data_addr,
            desc.dataset,
            desc.partition,
            PullRequest {
                flow_id: assignment.flow_id.clone(),
                consumer: assignment.spec.id.clone(),
                attempt: desc.attempt,
                staged: desc.staged,
            },
        )
        .await?;
        Ok(Box::new(reader))
    }

    async fn announce(&self, assignment: &TaskAssignment, delivery: Delivery) -> Result<()> {
        let spec = &assignment.spec;
        let staged = delivery == Delivery::Staged;
        let desc = ShuffleDescriptor {
            flow_id: assignment.flow_id.clone(),
            dataset: spec.dataset,
            partition: spec.partition,
            attempt: assignment.attempt,
            executor_id: self.executor_id.clone(),
            data_addr: if staged {
                self.agent_data_addr.clone()
            } else {
                self.own_data_addr.clone()
            },
            persistence: spec.output.persistence,
            staged,
        };
        self.client
            .report_location(&self.agent_url, &desc)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AgentUnreachable => {
                    FlowError::shuffle(spec.dataset, spec.partition, e.to_string())
                }
                _ => e,
            })
    }
}
