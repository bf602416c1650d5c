use crate::dag::{FlowGraph, Persistence};
use crate::error::Result;
use crate::{DatasetId, StepId};

/// Reescritura pura del grafo: une cada step con su único consumidor tipo map
/// cuando el dataset intermedio no necesita existir por sí mismo.
///
/// Un par (productor, consumidor) se fusiona si:
/// - el intermedio es `memory` y tiene un único consumidor
/// - el consumidor es map/pipe, sin particionador y con esa única entrada
/// - ambos tienen el mismo conteo de particiones
///
/// Las cadenas crecen de forma voraz desde el step declarado primero.
/// El grafo devuelto queda con todos los conteos resueltos.
pub fn fuse(graph: &FlowGraph) -> Result<FlowGraph> {
    let mut g = graph.clone();
    g.resolve_partitions()?;

    let mut idx = 0;
    while idx < g.steps.len() {
        let producer_id = g.steps[idx].id;
        while let Some((intermediate, consumer)) = fusable_consumer(&g, producer_id)? {
            absorb(&mut g, producer_id, intermediate, consumer)?;
        }
        idx += 1;
    }
    Ok(g)
}

fn fusable_consumer(g: &FlowGraph, producer: StepId) -> Result<Option<(DatasetId, StepId)>> {
    let Some(step) = g.step(producer) else {
        return Ok(None);
    };
    let mid = g.dataset(step.output)?;
    if mid.persistence != Persistence::Memory {
        return Ok(None);
    }

    let consumers = g.consumers_of(mid.id);
    let [consumer] = consumers.as_slice() else {
        return Ok(None);
    };
    if !consumer.op.is_map_like()
        || !consumer.partitioner.is_none()
        || consumer.inputs.as_slice() != [mid.id]
    {
        return Ok(None);
    }

    let out = g.dataset(consumer.output)?;
    if out.partitions != mid.partitions {
        return Ok(None);
    }
    Ok(Some((mid.id, consumer.id)))
}

fn absorb(g: &mut FlowGraph, producer: StepId, mid: DatasetId, consumer: StepId) -> Result<()> {
    let Some(pos) = g.steps.iter().position(|s| s.id == consumer) else {
        return Ok(());
    };
    let absorbed = g.steps.remove(pos);

    if let Some(step) = g.steps.iter_mut().find(|s| s.id == producer) {
        step.logic.extend(absorbed.logic);
        step.fused_from.extend(absorbed.fused_from);
        step.output = absorbed.output;
        step.name = format!("{}+{}", step.name, absorbed.name);
        step.resources = match (step.resources, absorbed.resources) {
            (Some(a), Some(b)) => Some(a.max(&b)),
            (a, b) => a.or(b),
        };
    }

    g.datasets.remove(&mid);
    if let Some(out) = g.datasets.get_mut(&absorbed.output) {
        out.producer = Some(producer);
    }
    Ok(())
}
