use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{FlowError, Result};
use crate::resource::Resource;
use crate::{DatasetId, Record, StepId};

/* =========================
   Tipos del grafo lógico
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    /// Vive mientras vive el productor; perderlo implica recomputar.
    Memory,
    /// Se persiste en disco mientras se produce; se puede releer.
    OnDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Source,
    Map,
    Reduce,
    Join,
    Sort,
    Pipe,
}

impl OpKind {
    /// Operaciones que por naturaleza reparticionan su entrada.
    pub fn repartitions(&self) -> bool {
        matches!(self, OpKind::Reduce | OpKind::Join | OpKind::Sort)
    }

    /// Operaciones tipo map que pueden fusionarse con su productor.
    pub fn is_map_like(&self) -> bool {
        matches!(self, OpKind::Map | OpKind::Pipe)
    }
}

/// Cómo se ejecuta la lógica de un step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogicKind {
    /// Función compilada registrada por nombre en el `StepRegistry`.
    Native,
    /// Intérprete externo: se ejecuta `command <id del artefacto>`.
    Interpreter { command: String },
    /// Proceso externo: `sh -c command`.
    Process { command: String },
}

/// Referencia opaca a la lógica de usuario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepArtifact {
    pub id: String,
    pub kind: LogicKind,
    #[serde(default)]
    pub params: Value,
}

impl StepArtifact {
    pub fn native(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: LogicKind::Native,
            params: Value::Null,
        }
    }

    pub fn native_with(id: &str, params: Value) -> Self {
        Self {
            id: id.to_string(),
            kind: LogicKind::Native,
            params,
        }
    }

    pub fn process(command: &str) -> Self {
        Self {
            id: command.to_string(),
            kind: LogicKind::Process {
                command: command.to_string(),
            },
            params: Value::Null,
        }
    }

    pub fn interpreter(command: &str, script: &str) -> Self {
        Self {
            id: script.to_string(),
            kind: LogicKind::Interpreter {
                command: command.to_string(),
            },
            params: Value::Null,
        }
    }
}

/// Función registro → partición destino.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionerSpec {
    /// Pass-through: la partición p lee la partición p de su entrada.
    None,
    /// Hash estable de la clave; una clave por entrada o una compartida.
    Hash { keys: Vec<String> },
    /// Rangos ordenados: `bounds[i]` es el límite inferior de la partición i+1.
    Range { key: String, bounds: Vec<Value> },
    /// Particionador registrado por nombre.
    Custom { name: String },
}

impl PartitionerSpec {
    pub fn hash(key: &str) -> Self {
        PartitionerSpec::Hash {
            keys: vec![key.to_string()],
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, PartitionerSpec::None)
    }
}

/// Origen de un dataset externo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Registros en línea, una lista por partición.
    Inline { partitions: Vec<Vec<Record>> },
    /// Un archivo de texto por partición, un registro por línea.
    TextFiles { paths: Vec<String> },
}

impl SourceSpec {
    pub fn inline(partitions: Vec<Vec<Record>>) -> Self {
        SourceSpec::Inline { partitions }
    }

    /// Expande un patrón glob (orden lexicográfico) a un source de archivos.
    pub fn text_glob(pattern: &str) -> Result<Self> {
        let entries = glob::glob(pattern)
            .map_err(|e| FlowError::InvalidGraph(format!("patrón inválido {pattern}: {e}")))?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => paths.push(path.to_string_lossy().to_string()),
                Ok(_) => {}
                Err(e) => {
                    return Err(FlowError::InvalidGraph(format!(
                        "no se pudo leer {pattern}: {e}"
                    )))
                }
            }
        }
        paths.sort();
        Ok(SourceSpec::TextFiles { paths })
    }

    pub fn partition_count(&self) -> u32 {
        match self {
            SourceSpec::Inline { partitions } => partitions.len() as u32,
            SourceSpec::TextFiles { paths } => paths.len() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    /// `None` hasta que el planner resuelve el conteo heredado.
    pub partitions: Option<u32>,
    pub persistence: Persistence,
    pub producer: Option<StepId>,
    pub source: Option<SourceSpec>,
}

impl Dataset {
    pub fn is_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn partition_count(&self) -> Result<u32> {
        self.partitions.ok_or_else(|| {
            FlowError::InvalidGraph(format!(
                "el dataset {} no tiene conteo de particiones resuelto",
                self.id
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<DatasetId>,
    pub output: DatasetId,
    /// Etapas de lógica en orden; más de una sólo tras la fusión.
    pub logic: Vec<StepArtifact>,
    pub partitioner: PartitionerSpec,
    pub resources: Option<Resource>,
    /// Steps originales absorbidos por la fusión (incluye el propio).
    #[serde(default)]
    pub fused_from: Vec<StepId>,
}

impl Step {
    /// ¿Este step mueve registros entre particiones?
    pub fn repartitions(&self) -> bool {
        self.op.repartitions() || !self.partitioner.is_none()
    }
}

/// Opciones de `add_step_with`.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub name: Option<String>,
    pub partitions: Option<u32>,
    pub persistence: Option<Persistence>,
    pub resources: Option<Resource>,
}

impl StepOptions {
    pub fn partitions(n: u32) -> Self {
        Self {
            partitions: Some(n),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn persisted(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }
}

/* =========================
   FlowGraph
   ========================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub name: String,
    pub datasets: BTreeMap<DatasetId, Dataset>,
    /// En orden de declaración.
    pub steps: Vec<Step>,
    next_dataset: DatasetId,
    next_step: StepId,
}

impl FlowGraph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            datasets: BTreeMap::new(),
            steps: Vec::new(),
            next_dataset: 0,
            next_step: 0,
        }
    }

    /// Agrega un dataset externo. Debe tener al menos una partición.
    pub fn add_source(
        &mut self,
        name: &str,
        source: SourceSpec,
        persistence: Persistence,
    ) -> Result<DatasetId> {
        let count = source.partition_count();
        if count == 0 {
            return Err(FlowError::InvalidGraph(format!(
                "el source {name} no tiene particiones"
            )));
        }

        let id = self.next_dataset;
        self.next_dataset += 1;
        self.datasets.insert(
            id,
            Dataset {
                id,
                name: name.to_string(),
                partitions: Some(count),
                persistence,
                producer: None,
                source: Some(source),
            },
        );
        Ok(id)
    }

    pub fn add_step(
        &mut self,
        inputs: &[DatasetId],
        op: OpKind,
        partitioner: PartitionerSpec,
        artifact: StepArtifact,
    ) -> Result<DatasetId> {
        self.add_step_with(inputs, op, partitioner, artifact, StepOptions::default())
    }

    /// Agrega un par step/dataset y devuelve el dataset de salida.
    pub fn add_step_with(
        &mut self,
        inputs: &[DatasetId],
        op: OpKind,
        partitioner: PartitionerSpec,
        artifact: StepArtifact,
        opts: StepOptions,
    ) -> Result<DatasetId> {
        if inputs.is_empty() {
            return Err(FlowError::InvalidGraph(
                "un step necesita al menos una entrada".to_string(),
            ));
        }
        if op == OpKind::Source {
            return Err(FlowError::InvalidGraph(
                "los sources se agregan con add_source".to_string(),
            ));
        }
        for ds in inputs {
            if !self.datasets.contains_key(ds) {
                return Err(FlowError::UnknownDataset(*ds));
            }
        }
        if opts.partitions == Some(0) {
            return Err(FlowError::InvalidGraph(
                "el conteo de particiones debe ser >= 1".to_string(),
            ));
        }

        let step_id = self.next_step;
        let out_id = self.next_dataset;
        let name = opts
            .name
            .unwrap_or_else(|| format!("{}-{}", artifact.id, step_id));

        self.datasets.insert(
            out_id,
            Dataset {
                id: out_id,
                name: name.clone(),
                partitions: opts.partitions,
                persistence: opts.persistence.unwrap_or(Persistence::Memory),
                producer: Some(step_id),
                source: None,
            },
        );
        self.steps.push(Step {
            id: step_id,
            name,
            op,
            inputs: inputs.to_vec(),
            output: out_id,
            logic: vec![artifact],
            partitioner,
            resources: opts.resources,
            fused_from: vec![step_id],
        });

        // El builder sólo agrega hacia adelante, pero se verifica igual.
        if let Err(e) = self.topological_order() {
            self.steps.pop();
            self.datasets.remove(&out_id);
            return Err(e);
        }

        self.next_step += 1;
        self.next_dataset += 1;
        Ok(out_id)
    }

    pub fn set_persistence(&mut self, dataset: DatasetId, persistence: Persistence) -> Result<()> {
        let ds = self
            .datasets
            .get_mut(&dataset)
            .ok_or(FlowError::UnknownDataset(dataset))?;
        ds.persistence = persistence;
        Ok(())
    }

    pub fn dataset(&self, id: DatasetId) -> Result<&Dataset> {
        self.datasets.get(&id).ok_or(FlowError::UnknownDataset(id))
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn producer_of(&self, dataset: DatasetId) -> Option<&Step> {
        self.steps.iter().find(|s| s.output == dataset)
    }

    /// Steps que leen `dataset`, en orden de declaración.
    pub fn consumers_of(&self, dataset: DatasetId) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.inputs.contains(&dataset))
            .collect()
    }

    /// Datasets sin consumidores: el resultado del flujo.
    pub fn sinks(&self) -> Vec<DatasetId> {
        self.datasets
            .keys()
            .copied()
            .filter(|id| self.consumers_of(*id).is_empty())
            .collect()
    }

    /// Orden topológico de datasets (Kahn); a igualdad, el id más bajo primero.
    pub fn topological_order(&self) -> Result<Vec<DatasetId>> {
        let mut indegree: HashMap<DatasetId, usize> =
            self.datasets.keys().map(|id| (*id, 0)).collect();
        let mut edges: HashMap<DatasetId, Vec<DatasetId>> = HashMap::new();

        for step in &self.steps {
            for input in &step.inputs {
                edges.entry(*input).or_default().push(step.output);
                *indegree.entry(step.output).or_insert(0) += 1;
            }
        }

        let mut ready: BTreeSet<DatasetId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            if let Some(next) = edges.get(&id) {
                for n in next {
                    if let Some(d) = indegree.get_mut(n) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert(*n);
                        }
                    }
                }
            }
        }

        if order.len() != indegree.len() {
            let stuck = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .min()
                .unwrap_or_default();
            return Err(FlowError::CycleDetected { dataset: stuck });
        }
        Ok(order)
    }

    /// Revalida un grafo que no se construyó con el builder (por ejemplo,
    /// deserializado): referencias, un productor por dataset y aciclicidad.
    pub fn validate(&self) -> Result<()> {
        let mut producers: HashMap<DatasetId, StepId> = HashMap::new();

        for step in &self.steps {
            if step.inputs.is_empty() {
                return Err(FlowError::InvalidGraph(format!(
                    "el step {} no tiene entradas",
                    step.id
                )));
            }
            if step.logic.is_empty() {
                return Err(FlowError::InvalidGraph(format!(
                    "el step {} no tiene lógica asociada",
                    step.id
                )));
            }
            for input in &step.inputs {
                self.dataset(*input)?;
            }
            let out = self.dataset(step.output)?;
            if out.is_source() {
                return Err(FlowError::InvalidGraph(format!(
                    "el step {} escribe sobre el source {}",
                    step.id, out.id
                )));
            }
            if producers.insert(step.output, step.id).is_some() {
                return Err(FlowError::InvalidGraph(format!(
                    "el dataset {} tiene más de un productor",
                    step.output
                )));
            }
            if out.producer != Some(step.id) {
                return Err(FlowError::InvalidGraph(format!(
                    "el dataset {} no referencia a su productor {}",
                    out.id, step.id
                )));
            }
        }

        for ds in self.datasets.values() {
            if !ds.is_source() && !producers.contains_key(&ds.id) {
                return Err(FlowError::InvalidGraph(format!(
                    "el dataset {} no tiene productor ni source",
                    ds.id
                )));
            }
            if ds.partitions == Some(0) {
                return Err(FlowError::InvalidGraph(format!(
                    "el dataset {} declara cero particiones",
                    ds.id
                )));
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Resuelve los conteos de particiones en orden topológico:
    /// - pass-through: hereda de sus entradas (que deben coincidir)
    /// - reparticionado: exige particionador y conteo explícito
    pub fn resolve_partitions(&mut self) -> Result<()> {
        let order = self.topological_order()?;

        for ds_id in order {
            let Some(step) = self.producer_of(ds_id).cloned() else {
                continue;
            };

            if step.repartitions() {
                if step.partitioner.is_none() {
                    return Err(FlowError::UnresolvedPartitioner {
                        step: step.id,
                        dataset: ds_id,
                    });
                }
                if self.dataset(ds_id)?.partitions.is_none() {
                    return Err(FlowError::InvalidGraph(format!(
                        "el step {} reparticiona y debe declarar su conteo de particiones",
                        step.name
                    )));
                }
                continue;
            }

            let mut inherited: Option<u32> = None;
            for input in &step.inputs {
                let n = self.dataset(*input)?.partition_count()?;
                match inherited {
                    None => inherited = Some(n),
                    Some(m) if m != n => {
                        return Err(FlowError::UnresolvedPartitioner {
                            step: step.id,
                            dataset: ds_id,
                        })
                    }
                    _ => {}
                }
            }
            let inherited = inherited.ok_or_else(|| {
                FlowError::InvalidGraph(format!("el step {} no tiene entradas", step.id))
            })?;

            let ds = self
                .datasets
                .get_mut(&ds_id)
                .ok_or(FlowError::UnknownDataset(ds_id))?;
            match ds.partitions {
                Some(explicit) if explicit != inherited => {
                    return Err(FlowError::UnresolvedPartitioner {
                        step: step.id,
                        dataset: ds_id,
                    })
                }
                _ => ds.partitions = Some(inherited),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inline(parts: usize) -> SourceSpec {
        SourceSpec::inline(vec![vec![b"x".to_vec()]; parts])
    }

    #[test]
    fn add_step_crea_dataset_con_productor() {
        let mut g = FlowGraph::new("t");
        let src = g.add_source("src", inline(2), Persistence::Memory).unwrap();
        let out = g
            .add_step(&[src], OpKind::Map, PartitionerSpec::None, StepArtifact::native("identity"))
            .unwrap();

        let ds = g.dataset(out).unwrap();
        assert_eq!(ds.producer, Some(0));
        assert_eq!(g.consumers_of(src).len(), 1);
        assert_eq!(g.sinks(), vec![out]);
        assert_eq!(g.topological_order().unwrap(), vec![src, out]);
    }

    #[test]
    fn entrada_desconocida_se_rechaza() {
        let mut g = FlowGraph::new("t");
        let err = g
            .add_step(&[7], OpKind::Map, PartitionerSpec::None, StepArtifact::native("identity"))
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownDataset(7)));
    }

    #[test]
    fn source_sin_particiones_es_invalido() {
        let mut g = FlowGraph::new("t");
        let err = g
            .add_source("vacio", SourceSpec::inline(vec![]), Persistence::Memory)
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidGraph(_)));
    }

    #[test]
    fn validate_detecta_ciclos_en_grafo_deserializado() {
        let mut g = FlowGraph::new("t");
        let src = g.add_source("src", inline(1), Persistence::Memory).unwrap();
        let a = g
            .add_step(&[src], OpKind::Map, PartitionerSpec::None, StepArtifact::native("identity"))
            .unwrap();
        let b = g
            .add_step(&[a], OpKind::Map, PartitionerSpec::None, StepArtifact::native("identity"))
            .unwrap();

        // a <- b: cierra un ciclo a -> b -> a
        let mut raw = serde_json::to_value(&g).unwrap();
        raw["steps"][0]["inputs"] = json!([src, b]);
        let broken: FlowGraph = serde_json::from_value(raw).unwrap();

        assert!(matches!(
            broken.validate(),
            Err(FlowError::CycleDetected { .. })
        ));
        assert!(g.validate().is_ok());
    }

    #[test]
    fn reduce_sin_particionador_no_se_resuelve() {
        let mut g = FlowGraph::new("t");
        let src = g.add_source("src", inline(2), Persistence::Memory).unwrap();
        let out = g
            .add_step_with(
                &[src],
                OpKind::Reduce,
                PartitionerSpec::None,
                StepArtifact::native("sum_by_key"),
                StepOptions::partitions(3),
            )
            .unwrap();

        let err = g.resolve_partitions().unwrap_err();
        assert!(matches!(
            err,
            FlowError::UnresolvedPartitioner { step: 0, dataset } if dataset == out
        ));
    }

    #[test]
    fn repartition_requires_explicit_count() {
        let mut g = FlowGraph::new("t");
        let src = g.add_source("src", inline(2), Persistence::Memory).unwrap();
        g.add_step(
            &[src],
            OpKind::Reduce,
            PartitionerSpec::hash("token"),
            StepArtifact::native("sum_by_key"),
        )
        .unwrap();

        assert!(matches!(
            g.resolve_partitions(),
            Err(FlowError::InvalidGraph(_))
        ));
    }

    #[test]
    fn pass_through_hereda_y_valida_conteos() {
        let mut g = FlowGraph::new("t");
        let a = g.add_source("a", inline(2), Persistence::Memory).unwrap();
        let b = g.add_source("b", inline(3), Persistence::Memory).unwrap();
        let m = g
            .add_step(&[a], OpKind::Map, PartitionerSpec::None, StepArtifact::native("identity"))
            .unwrap();
        g.resolve_partitions().unwrap();
        assert_eq!(g.dataset(m).unwrap().partitions, Some(2));

        // entradas con conteos distintos y sin particionador
        g.add_step(&[a, b], OpKind::Map, PartitionerSpec::None, StepArtifact::native("identity"))
            .unwrap();
        assert!(matches!(
            g.resolve_partitions(),
            Err(FlowError::UnresolvedPartitioner { .. })
        ));
    }

    #[test]
    fn text_glob_ordena_archivos() {
        let dir = std::env::temp_dir().join("dag_tests").join("glob");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.txt"), "b").unwrap();
        std::fs::write(dir.join("a.txt"), "a").unwrap();

        let pattern = format!("{}/*.txt", dir.display());
        let SourceSpec::TextFiles { paths } = SourceSpec::text_glob(&pattern).unwrap() else {
            panic!("se esperaba TextFiles");
        };
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("a.txt"));
        assert!(paths[1].ends_with("b.txt"));
    }
}
