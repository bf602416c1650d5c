//! Movimiento de particiones entre executors.
//!
//! - `buffer`: canal acotado por par (partición productora, consumidor)
//! - `exchange`: registro de receptores en espera de su consumidor
//! - `spill`: archivos de partición para datasets persistidos
//! - `net`: servidor y cliente TCP del plano de datos
//! - `publish`: lado productor de una tarea

use async_trait::async_trait;
use std::{path::Path, sync::Arc};

use crate::error::Result;
use crate::task::{Delivery, TaskAssignment, TaskInput};
use crate::{PartitionId, Record};

pub mod buffer;
pub mod exchange;
pub mod local;
pub mod net;
pub mod publish;
pub mod route;
pub mod spill;

pub use buffer::{bounded, BufferReceiver, BufferSender, Chunk};
pub use exchange::{ChannelKey, ExchangeHub};
pub use local::LocalTransport;
pub use net::{open_remote, DataServer, RemoteReader};
pub use publish::OutputPublisher;
pub use route::RouteFilter;
pub use spill::{partition_path, SpillReader, SpillWriter};

/// Lector secuencial de una partición de entrada.
#[async_trait]
pub trait PartitionReader: Send {
    /// `None` al llegar al fin de partición.
    async fn next_record(&mut self) -> Result<Option<Record>>;
}

/// Lo que un executor necesita del entorno para leer y publicar particiones.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Buffers de salida en streaming de este proceso.
    fn hub(&self) -> &Arc<ExchangeHub>;

    /// Raíz donde se escriben las particiones persistidas.
    fn spill_root(&self) -> &Path;

    async fn open_input(
        &self,
        assignment: &TaskAssignment,
        input: &TaskInput,
        partition: PartitionId,
    ) -> Result<Box<dyn PartitionReader>>;

    /// Publica la ubicación de la salida de la tarea (ShuffleDescriptor).
    async fn announce(&self, assignment: &TaskAssignment, delivery: Delivery) -> Result<()>;
}
