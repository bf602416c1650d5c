use std::time::Duration;
use tracing::{debug, warn};

/// Cada cuánto se revisa un buffer que todavía tiene registros sin leer.
const DRAIN_POLL: Duration = Duration::from_millis(20);

use super::buffer::{bounded, BufferSender};
use super::exchange::ChannelKey;
use super::route::RouteFilter;
use super::spill::SpillWriter;
use super::Transport;
use crate::error::{ErrorBody, Result};
use crate::steps::StepRegistry;
use crate::task::{Delivery, TaskAssignment};
use crate::{DatasetId, PartitionId, Record, TaskId};

struct StreamTarget {
    consumer: TaskId,
    sender: BufferSender,
    route: Option<RouteFilter>,
}

enum Sink {
    Streamed(Vec<StreamTarget>),
    Staged(SpillWriter),
}

/// Lado productor de una tarea: un buffer acotado por consumidor en
/// streaming, o un archivo de partición si la salida se persiste.
pub struct OutputPublisher {
    dataset: DatasetId,
    partition: PartitionId,
    sink: Sink,
    records_out: u64,
    linger: Duration,
}

impl OutputPublisher {
    /// Abre la salida. En streaming, los buffers quedan publicados en el hub y
    /// la ubicación se anuncia de inmediato para que los consumidores conecten.
    pub async fn open(
        assignment: &TaskAssignment,
        registry: &StepRegistry,
        transport: &dyn Transport,
    ) -> Result<Self> {
        let spec = &assignment.spec;
        let (dataset, partition) = (spec.dataset, spec.partition);

        let sink = match spec.output.delivery {
            Delivery::Streamed => {
                let mut targets = Vec::with_capacity(spec.output.consumers.len());
                for c in &spec.output.consumers {
                    let route = match &c.route {
                        Some(r) => RouteFilter::from_route(r, registry)?,
                        None => None,
                    };
                    let (sender, rx) = bounded(assignment.shuffle.buffer_records, dataset, partition);
                    transport.hub().publish(
                        ChannelKey {
                            flow_id: assignment.flow_id.clone(),
                            dataset,
                            partition,
                            attempt: assignment.attempt,
                            consumer: c.task.clone(),
                        },
                        rx,
                    );
                    targets.push(StreamTarget {
                        consumer: c.task.clone(),
                        sender,
                        route,
                    });
                }
                transport.announce(assignment, Delivery::Streamed).await?;
                Sink::Streamed(targets)
            }
            Delivery::Staged => Sink::Staged(
                SpillWriter::create(
                    transport.spill_root(),
                    &assignment.flow_id,
                    dataset,
                    partition,
                    assignment.attempt,
                )
                .await?,
            ),
        };

        Ok(Self {
            dataset,
            partition,
            sink,
            records_out: 0,
            linger: assignment.shuffle.linger_timeout(),
        })
    }

    pub async fn push(&mut self, record: Record) -> Result<()> {
        self.records_out += 1;
        match &mut self.sink {
            Sink::Streamed(targets) => {
                for t in targets.iter() {
                    let accepted = match &t.route {
                        Some(f) => f.accepts(&record)?,
                        None => true,
                    };
                    if accepted {
                        t.sender.send(record.clone()).await?;
                    }
                }
                Ok(())
            }
            Sink::Staged(w) => w.write(&record).await,
        }
    }

    /// Registros entregados a la salida (antes del ruteo por consumidor).
    pub fn records_out(&self) -> u64 {
        self.records_out
    }

    /// Cierra la salida. En streaming espera a que cada consumidor lea su
    /// buffer completo; persistido, hace commit y anuncia.
    pub async fn finish(&mut self, assignment: &TaskAssignment, transport: &dyn Transport) -> Result<()> {
        match &mut self.sink {
            Sink::Streamed(targets) => {
                for t in targets.iter() {
                    t.sender.end().await?;
                }
                for t in targets.iter() {
                    wait_consumer(t, self.linger, self.dataset, self.partition).await;
                }
                Ok(())
            }
            Sink::Staged(w) => {
                w.commit().await?;
                transport.announce(assignment, Delivery::Staged).await
            }
        }
    }

    pub async fn abort(&mut self, err: &ErrorBody) {
        debug!(
            "abortando salida d{}-p{}: {}",
            self.dataset, self.partition, err.message
        );
        match &mut self.sink {
            Sink::Streamed(targets) => {
                for t in targets.iter() {
                    t.sender.fail(err.clone());
                }
            }
            Sink::Staged(w) => w.abort().await,
        }
    }
}

/// Mientras el buffer tenga registros sin leer no hay plazo: un consumidor que
/// conecta tarde (p. ej. la segunda entrada de un join) los encuentra intactos.
/// La espera queda acotada por el timeout de la tarea o por la purga del hub.
/// Con el buffer ya vacío, `linger` acota cuánto tarda el consumidor en soltarlo.
async fn wait_consumer(t: &StreamTarget, linger: Duration, dataset: DatasetId, partition: PartitionId) {
    let mut waiting = false;
    while t.sender.occupancy() > 0 {
        if !waiting {
            debug!(
                "d{}-p{}: esperando a {} ({} registros en el buffer)",
                dataset,
                partition,
                t.consumer,
                t.sender.occupancy()
            );
            waiting = true;
        }
        tokio::select! {
            _ = t.sender.drained() => return,
            _ = tokio::time::sleep(DRAIN_POLL) => {}
        }
    }
    if tokio::time::timeout(linger, t.sender.drained()).await.is_err() {
        warn!(
            "d{}-p{}: el consumidor {} no soltó su buffer a tiempo",
            dataset, partition, t.consumer
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShuffleConfig;
    use crate::dag::Persistence;
    use crate::resource::Resource;
    use crate::shuffle::{LocalTransport, PartitionReader};
    use crate::task::{ConsumerSpec, OutputSpec, SourcePartition, TaskSpec, TaskWork};
    use std::env;

    fn streamed_assignment(linger_ms: u64) -> TaskAssignment {
        TaskAssignment {
            flow_id: "f".to_string(),
            attempt: 0,
            spec: TaskSpec {
                id: "d0-p0".to_string(),
                dataset: 0,
                partition: 0,
                partition_count: 1,
                work: TaskWork::Source {
                    source: SourcePartition::Inline { records: Vec::new() },
                },
                inputs: Vec::new(),
                output: OutputSpec {
                    delivery: Delivery::Streamed,
                    persistence: Persistence::Memory,
                    consumers: vec![ConsumerSpec {
                        task: "d1-p0".to_string(),
                        route: None,
                    }],
                },
                resources: Resource::new(1, 64, 0),
            },
            bindings: Vec::new(),
            timeout_ms: 10_000,
            shuffle: ShuffleConfig {
                linger_timeout_ms: linger_ms,
                ..ShuffleConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn finish_espera_al_consumidor_tardio_mas_alla_del_linger() {
        let root = env::temp_dir().join(format!("flow-publish-{}", uuid::Uuid::new_v4()));
        let transport = LocalTransport::new(root);
        let registry = StepRegistry::with_builtins();
        let a = streamed_assignment(10);

        let mut publisher = OutputPublisher::open(&a, &registry, &transport).await.unwrap();
        for r in [b"a".to_vec(), b"b".to_vec()] {
            publisher.push(r).await.unwrap();
        }
        assert_eq!(publisher.records_out(), 2);

        let closing = {
            let a = a.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                publisher.finish(&a, &transport).await.unwrap();
            })
        };

        // varias veces el linger sin consumidor: el buffer sigue vivo
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!closing.is_finished());

        let key = ChannelKey {
            flow_id: "f".to_string(),
            dataset: 0,
            partition: 0,
            attempt: 0,
            consumer: "d1-p0".to_string(),
        };
        let mut rx = transport
            .hub()
            .attach(&key, Duration::from_millis(100))
            .await
            .unwrap();
        let mut got = Vec::new();
        while let Some(r) = rx.next_record().await.unwrap() {
            got.push(r);
        }
        drop(rx);
        assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec()]);

        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .unwrap()
            .unwrap();
    }
}
