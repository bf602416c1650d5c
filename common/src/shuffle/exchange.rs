use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Notify;
use tracing::debug;

use super::buffer::BufferReceiver;
use crate::error::{FlowError, Result};
use crate::{DatasetId, FlowId, PartitionId, TaskId};

/// Identifica el buffer entre una partición productora y un consumidor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub flow_id: FlowId,
    pub dataset: DatasetId,
    pub partition: PartitionId,
    /// Intento del productor; evita mezclar salidas de reintentos.
    pub attempt: u32,
    pub consumer: TaskId,
}

/// Receptores publicados por productores en streaming, esperando a que su
/// consumidor los tome.
#[derive(Debug, Default)]
pub struct ExchangeHub {
    channels: Mutex<HashMap<ChannelKey, BufferReceiver>>,
    notify: Notify,
}

impl ExchangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelKey, BufferReceiver>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, key: ChannelKey, rx: BufferReceiver) {
        self.lock().insert(key, rx);
        self.notify.notify_waiters();
    }

    pub fn take(&self, key: &ChannelKey) -> Option<BufferReceiver> {
        self.lock().remove(key)
    }

    /// Espera a que el productor publique el buffer y lo toma.
    pub async fn attach(&self, key: &ChannelKey, timeout: Duration) -> Result<BufferReceiver> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(rx) = self.take(key) {
                debug!(
                    "consumidor {} conectado a d{}-p{} (intento {})",
                    key.consumer, key.dataset, key.partition, key.attempt
                );
                return Ok(rx);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(FlowError::shuffle(
                    key.dataset,
                    key.partition,
                    format!("el productor no publicó la salida para {}", key.consumer),
                ));
            }
        }
    }

    /// Descarta los buffers de un intento (por ejemplo, tras una falla).
    pub fn purge_attempt(&self, flow_id: &str, attempt: u32) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|k, _| !(k.flow_id == flow_id && k.attempt == attempt));
        before - map.len()
    }

    pub fn purge_flow(&self, flow_id: &str) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|k, _| k.flow_id != flow_id);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
