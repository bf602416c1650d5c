//! Framing del plano de datos:
//!
//! `[u32 largo][u8 tag][u32 dataset][u32 partición][payload]`, big-endian.
//! `largo` cuenta todo lo que sigue al propio prefijo.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorBody, FlowError, Result};
use crate::{DatasetId, FlowId, PartitionId, Record, TaskId};

pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const HEADER_BYTES: usize = 1 + 4 + 4;

const TAG_RECORD: u8 = 1;
const TAG_END: u8 = 2;
const TAG_ERROR: u8 = 3;
const TAG_PULL: u8 = 4;

/// Primer frame que envía un consumidor al conectarse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub flow_id: FlowId,
    pub consumer: TaskId,
    /// Intento del productor cuya salida se pide.
    pub attempt: u32,
    /// `true` para leer una partición persistida en disco.
    pub staged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Record(Record),
    /// Fin de partición.
    End,
    Error(ErrorBody),
    Pull(PullRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dataset: DatasetId,
    pub partition: PartitionId,
    pub body: FrameBody,
}

impl Frame {
    pub fn record(dataset: DatasetId, partition: PartitionId, record: Record) -> Self {
        Self {
            dataset,
            partition,
            body: FrameBody::Record(record),
        }
    }

    pub fn end(dataset: DatasetId, partition: PartitionId) -> Self {
        Self {
            dataset,
            partition,
            body: FrameBody::End,
        }
    }

    pub fn error(dataset: DatasetId, partition: PartitionId, err: ErrorBody) -> Self {
        Self {
            dataset,
            partition,
            body: FrameBody::Error(err),
        }
    }

    pub fn pull(dataset: DatasetId, partition: PartitionId, req: PullRequest) -> Self {
        Self {
            dataset,
            partition,
            body: FrameBody::Pull(req),
        }
    }
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let (tag, payload): (u8, Vec<u8>) = match &frame.body {
        FrameBody::Record(r) => (TAG_RECORD, r.clone()),
        FrameBody::End => (TAG_END, Vec::new()),
        FrameBody::Error(e) => (TAG_ERROR, serde_json::to_vec(e)?),
        FrameBody::Pull(p) => (TAG_PULL, serde_json::to_vec(p)?),
    };

    let len = HEADER_BYTES + payload.len();
    if len > MAX_FRAME_BYTES {
        return Err(FlowError::Protocol(format!(
            "frame de {len} bytes excede el máximo de {MAX_FRAME_BYTES}"
        )));
    }

    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.push(tag);
    buf.extend_from_slice(&frame.dataset.to_be_bytes());
    buf.extend_from_slice(&frame.partition.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodifica el cuerpo de un frame (sin el prefijo de largo).
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    if buf.len() < HEADER_BYTES {
        return Err(FlowError::Protocol(format!(
            "frame truncado: {} bytes",
            buf.len()
        )));
    }
    let tag = buf[0];
    let dataset = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let partition = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    let payload = &buf[HEADER_BYTES..];

    let body = match tag {
        TAG_RECORD => FrameBody::Record(payload.to_vec()),
        TAG_END => FrameBody::End,
        TAG_ERROR => FrameBody::Error(serde_json::from_slice(payload)?),
        TAG_PULL => FrameBody::Pull(serde_json::from_slice(payload)?),
        other => return Err(FlowError::Protocol(format!("tag de frame desconocido: {other}"))),
    };

    Ok(Frame {
        dataset,
        partition,
        body,
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    let buf = encode_frame(frame)?;
    w.write_all(&buf).await?;
    Ok(())
}

/// Lee el siguiente frame. `None` si el stream terminó limpio entre frames.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>> {
    let len = match r.read_u32().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !(HEADER_BYTES..=MAX_FRAME_BYTES).contains(&len) {
        return Err(FlowError::Protocol(format!("largo de frame inválido: {len}")));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    decode_frame(&buf).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn frames_se_leen_en_orden_y_eof_limpio_da_none() {
        let frames = vec![
            Frame::pull(
                1,
                2,
                PullRequest {
                    flow_id: "f".to_string(),
                    consumer: "d3-p0".to_string(),
                    attempt: 4,
                    staged: false,
                },
            ),
            Frame::record(1, 2, b"hola".to_vec()),
            Frame::record(1, 2, Vec::new()),
            Frame::error(
                1,
                2,
                ErrorBody {
                    kind: ErrorKind::StepLogic,
                    message: "x".to_string(),
                },
            ),
            Frame::end(1, 2),
        ];

        let mut wire = Vec::new();
        for f in &frames {
            write_frame(&mut wire, f).await.unwrap();
        }

        let mut reader = wire.as_slice();
        let mut got = Vec::new();
        while let Some(f) = read_frame(&mut reader).await.unwrap() {
            got.push(f);
        }
        assert_eq!(got, frames);
    }

    #[tokio::test]
    async fn frame_truncado_es_error() {
        let buf = encode_frame(&Frame::record(0, 0, b"abcdef".to_vec())).unwrap();
        let mut cut = &buf[..buf.len() - 2];
        assert!(read_frame(&mut cut).await.is_err());
    }

    #[test]
    fn tag_desconocido_es_error_de_protocolo() {
        let mut buf = encode_frame(&Frame::end(0, 0)).unwrap();
        buf[4] = 99;
        assert!(matches!(
            decode_frame(&buf[4..]),
            Err(FlowError::Protocol(_))
        ));
    }
}
