use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, FlowError, Result};
use crate::shuffle::{OutputPublisher, PartitionReader, RouteFilter, Transport};
use crate::steps::StepRegistry;
use crate::task::{Delivery, SourcePartition, TaskAssignment, TaskInput, TaskReport, TaskState, TaskWork};
use crate::{PartitionId, Record};

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    records_in: u64,
    records_out: u64,
}

/// Corre una tarea de punta a punta y devuelve su reporte. Nunca falla: los
/// errores quedan en `TaskReport::error` con estado `Failed`.
pub async fn run_task(
    assignment: &TaskAssignment,
    registry: &StepRegistry,
    transport: &dyn Transport,
) -> TaskReport {
    let spec = &assignment.spec;
    let mut state = TaskState::Pending;
    let mut counters = Counters::default();

    let _ = state.advance(TaskState::Running);
    info!(
        "tarea {} ({}) intento {} arrancando",
        spec.id,
        spec.step_name(),
        assignment.attempt
    );

    let work = execute(assignment, registry, transport, &mut counters);
    let result = if assignment.timeout_ms > 0 {
        match tokio::time::timeout(Duration::from_millis(assignment.timeout_ms), work).await {
            Ok(r) => r,
            Err(_) => Err(FlowError::TaskFailure {
                task: spec.id.clone(),
                reason: format!("timeout de {} ms", assignment.timeout_ms),
            }),
        }
    } else {
        work.await
    };

    let error = match result {
        Ok(()) => {
            let _ = state.advance(TaskState::Succeeded);
            info!(
                "tarea {} completada: {} in / {} out",
                spec.id, counters.records_in, counters.records_out
            );
            None
        }
        Err(e) => {
            let _ = state.advance(TaskState::Failed);
            warn!("tarea {} falló: {}", spec.id, e);
            Some(e.to_body())
        }
    };

    TaskReport {
        task_id: spec.id.clone(),
        attempt: assignment.attempt,
        state,
        records_in: counters.records_in,
        records_out: counters.records_out,
        error,
    }
}

async fn execute(
    assignment: &TaskAssignment,
    registry: &StepRegistry,
    transport: &dyn Transport,
    counters: &mut Counters,
) -> Result<()> {
    let mut publisher = OutputPublisher::open(assignment, registry, transport).await?;
    let fed = feed(assignment, registry, transport, &mut publisher, counters).await;
    counters.records_out = publisher.records_out();
    match fed {
        Ok(()) => publisher.finish(assignment, transport).await,
        Err(e) => {
            publisher.abort(&e.to_body()).await;
            Err(e)
        }
    }
}

async fn feed(
    assignment: &TaskAssignment,
    registry: &StepRegistry,
    transport: &dyn Transport,
    publisher: &mut OutputPublisher,
    counters: &mut Counters,
) -> Result<()> {
    match &assignment.spec.work {
        TaskWork::Source { source } => {
            match source {
                SourcePartition::Inline { records } => {
                    for r in records {
                        counters.records_in += 1;
                        publisher.push(r.clone()).await?;
                    }
                }
                SourcePartition::TextFile { path } => {
                    let file = tokio::fs::File::open(path).await?;
                    let mut lines = BufReader::new(file).lines();
                    while let Some(line) = lines.next_line().await? {
                        counters.records_in += 1;
                        publisher.push(line.trim_end_matches('\r').as_bytes().to_vec()).await?;
                    }
                }
            }
            Ok(())
        }
        TaskWork::Step { logic, .. } => {
            let mut logic = registry.chain(logic)?;
            let mut out: Vec<Record> = Vec::new();

            // entradas en orden, y dentro de cada una las particiones en orden
            for input in &assignment.spec.inputs {
                let route = match (&input.route, input.delivery) {
                    (Some(r), Delivery::Staged) => RouteFilter::from_route(r, registry)?,
                    _ => None,
                };
                for &p in &input.partitions {
                    let mut reader = InputCursor::new(assignment, input, p);
                    while let Some(record) = reader.next(transport).await? {
                        counters.records_in += 1;
                        if let Some(f) = &route {
                            if !f.accepts(&record)? {
                                continue;
                            }
                        }
                        logic.process(input.input_index, record, &mut out)?;
                        for r in out.drain(..) {
                            publisher.push(r).await?;
                        }
                    }
                }
            }

            logic.finish(&mut out)?;
            for r in out.drain(..) {
                publisher.push(r).await?;
            }
            Ok(())
        }
    }
}

/// Lectura de una partición de entrada con reconexión. Para entradas
/// persistidas, tras un corte se reabre y se saltean los registros ya
/// entregados; en streaming un corte es falla de la tarea.
struct InputCursor<'a> {
    assignment: &'a TaskAssignment,
    input: &'a TaskInput,
    partition: PartitionId,
    reader: Option<Box<dyn PartitionReader>>,
    delivered: u64,
    seen: u64,
    retries: u32,
    done: bool,
}

impl<'a> InputCursor<'a> {
    fn new(assignment: &'a TaskAssignment, input: &'a TaskInput, partition: PartitionId) -> Self {
        Self {
            assignment,
            input,
            partition,
            reader: None,
            delivered: 0,
            seen: 0,
            retries: 0,
            done: false,
        }
    }

    fn can_retry(&self, err: &FlowError) -> bool {
        self.input.delivery == Delivery::Staged
            && self.retries < self.assignment.shuffle.input_retries
            && err.kind() != ErrorKind::NotFound
    }

    async fn backoff(&mut self, err: &FlowError) {
        self.retries += 1;
        self.reader = None;
        warn!(
            "lectura de d{}-p{} falló ({}), reintento {}/{}",
            self.input.dataset,
            self.partition,
            err,
            self.retries,
            self.assignment.shuffle.input_retries
        );
        tokio::time::sleep(self.assignment.shuffle.retry_backoff()).await;
    }

    async fn next(&mut self, transport: &dyn Transport) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if self.reader.is_none() {
                match transport
                    .open_input(self.assignment, self.input, self.partition)
                    .await
                {
                    Ok(r) => {
                        self.reader = Some(r);
                        self.seen = 0;
                    }
                    Err(e) if self.can_retry(&e) => {
                        self.backoff(&e).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            match reader.next_record().await {
                Ok(Some(record)) => {
                    self.seen += 1;
                    if self.seen <= self.delivered {
                        continue;
                    }
                    self.delivered += 1;
                    return Ok(Some(record));
                }
                Ok(None) => {
                    debug!(
                        "entrada d{}-p{} agotada ({} registros)",
                        self.input.dataset, self.partition, self.delivered
                    );
                    self.done = true;
                    self.reader = None;
                    return Ok(None);
                }
                Err(e) if self.can_retry(&e) => self.backoff(&e).await,
                Err(e) => return Err(e),
            }
        }
    }
}
