use serde_json::json;

use crate::dag::{
    FlowGraph, OpKind, PartitionerSpec, Persistence, SourceSpec, StepArtifact, StepOptions,
};
use crate::error::Result;
use crate::DatasetId;

/// Limpia una palabra: sólo alfanumérico y '_', en minúscula.
pub fn normalize_token(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Grafo de WordCount:
/// lines -> tokenize -> to_lower -> filter_nonempty -> pair_with_one -> sum_by_key
///
/// Devuelve el grafo y el dataset final con registros `{"token", "count"}`.
pub fn wordcount_graph(source: SourceSpec, partitions: u32) -> Result<(FlowGraph, DatasetId)> {
    let mut g = FlowGraph::new("wordcount");
    let lines = g.add_source("lines", source, Persistence::Memory)?;

    let map = |g: &mut FlowGraph, input: DatasetId, id: &str| {
        g.add_step_with(
            &[input],
            OpKind::Map,
            PartitionerSpec::None,
            StepArtifact::native(id),
            StepOptions::default().named(id),
        )
    };

    let tokens = map(&mut g, lines, "tokenize")?;
    let lower = map(&mut g, tokens, "to_lower")?;
    let nonempty = map(&mut g, lower, "filter_nonempty")?;
    let pairs = map(&mut g, nonempty, "pair_with_one")?;

    let counts = g.add_step_with(
        &[pairs],
        OpKind::Reduce,
        PartitionerSpec::hash("token"),
        StepArtifact::native("sum_by_key"),
        StepOptions::partitions(partitions.max(1)).named("sum_by_key"),
    )?;

    Ok((g, counts))
}

/// Grafo de join: cada lado pasa por `parse_json` y luego un inner join
/// con particionado hash por la clave de cada lado.
pub fn join_graph(
    left: SourceSpec,
    right: SourceSpec,
    left_key: &str,
    right_key: &str,
    partitions: u32,
) -> Result<(FlowGraph, DatasetId)> {
    let mut g = FlowGraph::new("join");
    let l = g.add_source("left", left, Persistence::Memory)?;
    let r = g.add_source("right", right, Persistence::Memory)?;

    let parse = |g: &mut FlowGraph, input: DatasetId, name: &str| {
        g.add_step_with(
            &[input],
            OpKind::Map,
            PartitionerSpec::None,
            StepArtifact::native("parse_json"),
            StepOptions::default().named(name),
        )
    };
    let lp = parse(&mut g, l, "parse_left")?;
    let rp = parse(&mut g, r, "parse_right")?;

    let joined = g.add_step_with(
        &[lp, rp],
        OpKind::Join,
        PartitionerSpec::Hash {
            keys: vec![left_key.to_string(), right_key.to_string()],
        },
        StepArtifact::native_with(
            "join",
            json!({ "left_key": left_key, "right_key": right_key }),
        ),
        StepOptions::partitions(partitions.max(1)).named("join"),
    )?;

    Ok((g, joined))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_token_limpia_y_baja_a_minusculas() {
        assert_eq!(normalize_token("Hola,"), Some("hola".to_string()));
        assert_eq!(normalize_token("mundo_Prueba!!"), Some("mundo_prueba".to_string()));
        assert_eq!(normalize_token("!!!"), None);
    }

    #[test]
    fn wordcount_graph_tiene_cinco_steps() {
        let (g, out) =
            wordcount_graph(SourceSpec::inline(vec![vec![b"a b a".to_vec()]]), 2).unwrap();
        assert_eq!(g.steps.len(), 5);
        assert_eq!(g.sinks(), vec![out]);
        assert_eq!(g.dataset(out).unwrap().partitions, Some(2));
    }

    #[test]
    fn join_graph_usa_una_clave_por_lado() {
        let side = SourceSpec::inline(vec![vec![b"{}".to_vec()]]);
        let (g, out) = join_graph(side.clone(), side, "a1", "b2", 3).unwrap();
        let step = g.producer_of(out).unwrap();
        assert_eq!(step.inputs.len(), 2);
        assert_eq!(
            step.partitioner,
            PartitionerSpec::Hash {
                keys: vec!["a1".to_string(), "b2".to_string()]
            }
        );
    }
}
