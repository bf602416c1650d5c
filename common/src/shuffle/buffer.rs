use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use super::PartitionReader;
use crate::error::{ErrorBody, FlowError, Result};
use crate::{DatasetId, PartitionId, Record};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Record(Record),
    End,
    Failed(ErrorBody),
}

/// Canal acotado a `capacity` elementos. El productor se suspende cuando está
/// lleno; el consumidor, cuando está vacío y aún no llegó el fin de partición.
pub fn bounded(
    capacity: usize,
    dataset: DatasetId,
    partition: PartitionId,
) -> (BufferSender, BufferReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        BufferSender {
            tx,
            dataset,
            partition,
        },
        BufferReceiver {
            rx,
            dataset,
            partition,
            ended: false,
        },
    )
}

#[derive(Debug)]
pub struct BufferSender {
    tx: mpsc::Sender<Chunk>,
    dataset: DatasetId,
    partition: PartitionId,
}

impl BufferSender {
    pub async fn send(&self, record: Record) -> Result<()> {
        self.tx.send(Chunk::Record(record)).await.map_err(|_| {
            FlowError::shuffle(self.dataset, self.partition, "el consumidor se desconectó")
        })
    }

    pub async fn end(&self) -> Result<()> {
        self.tx.send(Chunk::End).await.map_err(|_| {
            FlowError::shuffle(self.dataset, self.partition, "el consumidor se desconectó")
        })
    }

    /// Aviso de falla sin bloquear; si el buffer está lleno el consumidor verá
    /// igual la desconexión cuando el sender se libere.
    pub fn fail(&self, err: ErrorBody) {
        match self.tx.try_send(Chunk::Failed(err)) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Elementos en el buffer ahora mismo.
    pub fn occupancy(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Se completa cuando el consumidor soltó su extremo.
    pub async fn drained(&self) {
        self.tx.closed().await
    }
}

#[derive(Debug)]
pub struct BufferReceiver {
    rx: mpsc::Receiver<Chunk>,
    dataset: DatasetId,
    partition: PartitionId,
    ended: bool,
}

impl BufferReceiver {
    pub async fn recv(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }

    /// `None` si no hay nada listo (o el canal se cerró).
    pub fn try_recv(&mut self) -> Option<Chunk> {
        match self.rx.try_recv() {
            Ok(c) => Some(c),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[async_trait]
impl PartitionReader for BufferReceiver {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        if self.ended {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Chunk::Record(r)) => Ok(Some(r)),
            Some(Chunk::End) => {
                self.ended = true;
                Ok(None)
            }
            Some(Chunk::Failed(e)) => Err(FlowError::shuffle(
                self.dataset,
                self.partition,
                format!("el productor falló: {}", e.message),
            )),
            None => Err(FlowError::shuffle(
                self.dataset,
                self.partition,
                "el productor terminó sin fin de partición",
            )),
        }
    }
}
