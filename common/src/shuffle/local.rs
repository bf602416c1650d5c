use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use super::exchange::{ChannelKey, ExchangeHub};
use super::spill::{partition_path, SpillReader};
use super::{PartitionReader, Transport};
use crate::error::Result;
use crate::task::{Delivery, TaskAssignment, TaskInput};
use crate::PartitionId;

/// Transporte dentro de un solo proceso: streaming por el hub compartido y
/// particiones persistidas leídas directo del disco.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    hub: Arc<ExchangeHub>,
    spill_root: PathBuf,
}

impl LocalTransport {
    pub fn new(spill_root: PathBuf) -> Self {
        Self {
            hub: Arc::new(ExchangeHub::new()),
            spill_root,
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
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
        match input.delivery {
            Delivery::Streamed => {
                let attempt = assignment
                    .binding(input.dataset, partition)
                    .map(|b| b.attempt)
                    .unwrap_or(assignment.attempt);
                let key = ChannelKey {
                    flow_id: assignment.flow_id.clone(),
                    dataset: input.dataset,
                    partition,
                    attempt,
                    consumer: assignment.spec.id.clone(),
                };
                let rx = self
                    .hub
                    .attach(&key, assignment.shuffle.attach_timeout())
                    .await?;
                Ok(Box::new(rx))
            }
            Delivery::Staged => {
                let path =
                    partition_path(&self.spill_root, &assignment.flow_id, input.dataset, partition);
                Ok(Box::new(SpillReader::open(&path, input.dataset, partition).await?))
            }
        }
    }

    async fn announce(&self, _assignment: &TaskAssignment, _delivery: Delivery) -> Result<()> {
        Ok(())
    }
}
