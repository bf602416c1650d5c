use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufReader, BufWriter},
};
use tracing::{debug, warn};

use super::PartitionReader;
use crate::error::{FlowError, Result};
use crate::frame::{read_frame, write_frame, Frame, FrameBody};
use crate::{DatasetId, PartitionId, Record};

/* =========================
   Rutas
   ========================= */

pub fn flow_dir(root: &Path, flow_id: &str) -> PathBuf {
    root.join("flows").join(flow_id)
}

pub fn dataset_dir(root: &Path, flow_id: &str, dataset: DatasetId) -> PathBuf {
    flow_dir(root, flow_id).join(format!("d{dataset}"))
}

/// `<root>/flows/<flow>/d<ds>/part-<p>.frames`
pub fn partition_path(
    root: &Path,
    flow_id: &str,
    dataset: DatasetId,
    partition: PartitionId,
) -> PathBuf {
    dataset_dir(root, flow_id, dataset).join(format!("part-{partition}.frames"))
}

/* =========================
   Escritura
   ========================= */

/// Escribe una partición en un temporal y la publica con un rename atómico
/// en `commit`. Un writer que se suelta sin commit borra su temporal.
#[derive(Debug)]
pub struct SpillWriter {
    tmp: PathBuf,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    dataset: DatasetId,
    partition: PartitionId,
    records: u64,
}

impl SpillWriter {
    pub async fn create(
        root: &Path,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
        attempt: u32,
    ) -> Result<Self> {
        let path = partition_path(root, flow_id, dataset, partition);
        let dir = dataset_dir(root, flow_id, dataset);
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("part-{partition}.frames.tmp-{attempt}"));
        let file = File::create(&tmp).await?;

        Ok(Self {
            tmp,
            path,
            writer: Some(BufWriter::new(file)),
            dataset,
            partition,
            records: 0,
        })
    }

    pub async fn write(&mut self, record: &[u8]) -> Result<()> {
        let w = self.writer.as_mut().ok_or_else(|| {
            FlowError::shuffle(self.dataset, self.partition, "writer ya cerrado")
        })?;
        write_frame(w, &Frame::record(self.dataset, self.partition, record.to_vec())).await?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Escribe el fin de partición, sincroniza y renombra al destino final.
    pub async fn commit(&mut self) -> Result<PathBuf> {
        let mut w = self.writer.take().ok_or_else(|| {
            FlowError::shuffle(self.dataset, self.partition, "writer ya cerrado")
        })?;
        write_frame(&mut w, &Frame::end(self.dataset, self.partition)).await?;
        w.flush().await?;
        w.get_ref().sync_all().await?;
        drop(w);

        fs::rename(&self.tmp, &self.path).await?;
        debug!(
            "partición d{}-p{} persistida en {:?} ({} registros)",
            self.dataset, self.partition, self.path, self.records
        );
        Ok(self.path.clone())
    }

    pub async fn abort(&mut self) {
        if self.writer.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp).await {
                warn!("no se pudo borrar temporal {:?}: {}", self.tmp, e);
            }
        }
    }
}

impl Drop for SpillWriter {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

/* =========================
   Lectura
   ========================= */

#[derive(Debug)]
pub struct SpillReader {
    reader: BufReader<File>,
    dataset: DatasetId,
    partition: PartitionId,
    done: bool,
}

impl SpillReader {
    /// `NotFound` si la partición no existe (nunca se escribió o se borró).
    pub async fn open(path: &Path, dataset: DatasetId, partition: PartitionId) -> Result<Self> {
        let file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FlowError::NotFound(format!(
                    "partición d{dataset}-p{partition} no disponible en {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            reader: BufReader::new(file),
            dataset,
            partition,
            done: false,
        })
    }

    /// Siguiente frame crudo, para reenviarlo tal cual por la red.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        match read_frame(&mut self.reader).await? {
            Some(f) => {
                if f.body == FrameBody::End {
                    self.done = true;
                }
                Ok(Some(f))
            }
            None => Err(FlowError::shuffle(
                self.dataset,
                self.partition,
                "archivo de partición truncado",
            )),
        }
    }
}

#[async_trait]
impl PartitionReader for SpillReader {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        match self.next_frame().await? {
            None => Ok(None),
            Some(Frame { body, .. }) => match body {
                FrameBody::Record(r) => Ok(Some(r)),
                FrameBody::End => Ok(None),
                FrameBody::Error(e) => Err(FlowError::from(e)),
                FrameBody::Pull(_) => Err(FlowError::Protocol(
                    "frame de pull dentro de un archivo de partición".to_string(),
                )),
            },
        }
    }
}

/// Lee una partición completa a memoria.
pub async fn read_partition(
    root: &Path,
    flow_id: &str,
    dataset: DatasetId,
    partition: PartitionId,
) -> Result<Vec<Record>> {
    let path = partition_path(root, flow_id, dataset, partition);
    let mut reader = SpillReader::open(&path, dataset, partition).await?;
    let mut out = Vec::new();
    while let Some(r) = reader.next_record().await? {
        out.push(r);
    }
    Ok(out)
}

pub async fn partition_exists(
    root: &Path,
    flow_id: &str,
    dataset: DatasetId,
    partition: PartitionId,
) -> bool {
    fs::metadata(partition_path(root, flow_id, dataset, partition))
        .await
        .is_ok()
}

/// Borra un dataset completo del flow. Devuelve `true` si existía.
pub async fn remove_dataset(root: &Path, flow_id: &str, dataset: DatasetId) -> Result<bool> {
    let dir = dataset_dir(root, flow_id, dataset);
    match fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub async fn remove_flow(root: &Path, flow_id: &str) -> Result<bool> {
    let dir = flow_dir(root, flow_id);
    match fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
