use async_trait::async_trait;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncWriteExt, BufReader, BufWriter},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

use super::buffer::Chunk;
use super::exchange::{ChannelKey, ExchangeHub};
use super::spill::{partition_path, SpillReader};
use super::PartitionReader;
use crate::error::{ErrorBody, ErrorKind, FlowError, Result};
use crate::frame::{read_frame, write_frame, Frame, FrameBody, PullRequest};
use crate::{DatasetId, PartitionId, Record};

/// Servidor TCP del plano de datos de un agente.
///
/// Cada conexión pide una única partición con un frame `Pull`. Las salidas en
/// streaming se sirven desde el `ExchangeHub`; las persistidas, desde disco.
#[derive(Debug)]
pub struct DataServer {
    hub: Arc<ExchangeHub>,
    spill_root: PathBuf,
    attach_timeout: Duration,
}

impl DataServer {
    pub fn new(hub: Arc<ExchangeHub>, spill_root: PathBuf, attach_timeout: Duration) -> Self {
        Self {
            hub,
            spill_root,
            attach_timeout,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("plano de datos escuchando en {}", addr);
        }
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("accept falló: {}", e);
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream).await {
                    debug!("conexión de datos con {} terminó con error: {}", peer, e);
                }
            });
        }
    }

    async fn handle(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (rd, wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let mut wr = BufWriter::new(wr);

        let first = read_frame(&mut rd).await?.ok_or_else(|| {
            FlowError::Protocol("conexión cerrada antes del pull".to_string())
        })?;
        let (dataset, partition) = (first.dataset, first.partition);
        let req = match first.body {
            FrameBody::Pull(req) => req,
            _ => {
                return Err(FlowError::Protocol(
                    "se esperaba un frame de pull".to_string(),
                ))
            }
        };

        let served = if req.staged {
            self.serve_staged(&req, dataset, partition, &mut wr).await
        } else {
            self.serve_streamed(&req, dataset, partition, &mut wr).await
        };

        if let Err(e) = &served {
            // el consumidor tiene que ver la causa, no sólo un corte
            let _ = write_frame(&mut wr, &Frame::error(dataset, partition, e.to_body())).await;
        }
        let _ = wr.flush().await;
        let _ = wr.shutdown().await;
        served
    }

    async fn serve_staged<W>(
        &self,
        req: &PullRequest,
        dataset: DatasetId,
        partition: PartitionId,
        wr: &mut W,
    ) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let path = partition_path(&self.spill_root, &req.flow_id, dataset, partition);
        let mut reader = SpillReader::open(&path, dataset, partition).await?;
        while let Some(frame) = reader.next_frame().await? {
            write_frame(wr, &frame).await?;
        }
        Ok(())
    }

    async fn serve_streamed<W>(
        &self,
        req: &PullRequest,
        dataset: DatasetId,
        partition: PartitionId,
        wr: &mut W,
    ) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let key = ChannelKey {
            flow_id: req.flow_id.clone(),
            dataset,
            partition,
            attempt: req.attempt,
            consumer: req.consumer.clone(),
        };
        let mut rx = self.hub.attach(&key, self.attach_timeout).await?;

        loop {
            // flush sólo cuando el buffer quedó vacío
            let chunk = match rx.try_recv() {
                Some(c) => c,
                None => {
                    wr.flush().await?;
                    match rx.recv().await {
                        Some(c) => c,
                        None => {
                            return Err(FlowError::shuffle(
                                dataset,
                                partition,
                                "el productor terminó sin fin de partición",
                            ))
                        }
                    }
                }
            };
            match chunk {
                Chunk::Record(r) => write_frame(wr, &Frame::record(dataset, partition, r)).await?,
                Chunk::End => {
                    write_frame(wr, &Frame::end(dataset, partition)).await?;
                    // antes de soltar el receptor: el productor puede salir apenas lo vea
                    wr.flush().await?;
                    return Ok(());
                }
                Chunk::Failed(e) => {
                    write_frame(wr, &Frame::error(dataset, partition, e)).await?;
                    wr.flush().await?;
                    return Ok(());
                }
            }
        }
    }
}

/* =========================
   Cliente
   ========================= */

/// Lectura remota de una partición servida por un `DataServer`.
#[derive(Debug)]
pub struct RemoteReader {
    stream: BufReader<TcpStream>,
    dataset: DatasetId,
    partition: PartitionId,
    done: bool,
}

pub async fn open_remote(
    addr: &str,
    dataset: DatasetId,
    partition: PartitionId,
    req: PullRequest,
) -> Result<RemoteReader> {
    let mut stream = TcpStream::connect(addr).await.map_err(|e| {
        FlowError::shuffle(dataset, partition, format!("no se pudo conectar a {addr}: {e}"))
    })?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, &Frame::pull(dataset, partition, req)).await?;
    stream.flush().await?;

    Ok(RemoteReader {
        stream: BufReader::new(stream),
        dataset,
        partition,
        done: false,
    })
}

#[async_trait]
impl PartitionReader for RemoteReader {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        let frame = read_frame(&mut self.stream)
            .await
            .map_err(|e| FlowError::shuffle(self.dataset, self.partition, e.to_string()))?;
        match frame.map(|f| f.body) {
            Some(FrameBody::Record(r)) => Ok(Some(r)),
            Some(FrameBody::End) => {
                self.done = true;
                Ok(None)
            }
            Some(FrameBody::Error(body)) => Err(remote_error(self.dataset, self.partition, body)),
            Some(FrameBody::Pull(_)) => Err(FlowError::Protocol(
                "pull inesperado desde el servidor".to_string(),
            )),
            None => Err(FlowError::shuffle(
                self.dataset,
                self.partition,
                "conexión cerrada antes del fin de partición",
            )),
        }
    }
}

/// `NotFound` se conserva (entrada perdida); lo demás es falla de transporte.
fn remote_error(dataset: DatasetId, partition: PartitionId, body: ErrorBody) -> FlowError {
    match body.kind {
        ErrorKind::NotFound => FlowError::NotFound(body.message),
        _ => FlowError::shuffle(dataset, partition, body.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::buffer::bounded;
    use crate::shuffle::spill::SpillWriter;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("flow-net-{}-{}", sub, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn start(root: PathBuf) -> (Arc<ExchangeHub>, String) {
        let hub = Arc::new(ExchangeHub::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(DataServer::new(hub.clone(), root, Duration::from_secs(2)));
        tokio::spawn(server.serve(listener));
        (hub, addr)
    }

    fn pull(consumer: &str, staged: bool) -> PullRequest {
        PullRequest {
            flow_id: "f".to_string(),
            consumer: consumer.to_string(),
            attempt: 0,
            staged,
        }
    }

    #[tokio::test]
    async fn streaming_remoto_entrega_en_orden() {
        let root = temp_dir("stream");
        let (hub, addr) = start(root.clone()).await;

        let (tx, rx) = bounded(2, 1, 0);
        hub.publish(
            ChannelKey {
                flow_id: "f".to_string(),
                dataset: 1,
                partition: 0,
                attempt: 0,
                consumer: "d2-p0".to_string(),
            },
            rx,
        );

        let producer = tokio::spawn(async move {
            for i in 0..10u8 {
                tx.send(vec![i]).await.unwrap();
            }
            tx.end().await.unwrap();
            tx.drained().await;
        });

        let mut reader = open_remote(&addr, 1, 0, pull("d2-p0", false)).await.unwrap();
        let mut got = Vec::new();
        while let Some(r) = reader.next_record().await.unwrap() {
            got.push(r[0]);
        }
        assert_eq!(got, (0..10u8).collect::<Vec<_>>());
        producer.await.unwrap();
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn particion_persistida_se_sirve_desde_disco() {
        let root = temp_dir("staged");
        let mut w = SpillWriter::create(&root, "f", 4, 1, 0).await.unwrap();
        w.write(b"r1").await.unwrap();
        w.commit().await.unwrap();

        let (_hub, addr) = start(root.clone()).await;
        let mut reader = open_remote(&addr, 4, 1, pull("x", true)).await.unwrap();
        assert_eq!(reader.next_record().await.unwrap(), Some(b"r1".to_vec()));
        assert_eq!(reader.next_record().await.unwrap(), None);

        // partición inexistente: NotFound
        let mut missing = open_remote(&addr, 4, 7, pull("x", true)).await.unwrap();
        assert!(matches!(
            missing.next_record().await,
            Err(FlowError::NotFound(_))
        ));
        let _ = std::fs::remove_dir_all(root);
    }
}
