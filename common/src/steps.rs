use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::dag::{LogicKind, PartitionerSpec, StepArtifact};
use crate::engine;
use crate::error::{FlowError, Result};
use crate::partition::{HashPartitioner, RangePartitioner};
use crate::pipe::PipeLogic;
use crate::{PartitionId, Record};

/// Lógica de usuario como transformación de caja negra.
///
/// El executor entrega las entradas en orden: primero todas las particiones
/// de la entrada 0, luego las de la 1, etc. Dentro de una partición los
/// registros llegan en el orden en que se produjeron.
pub trait StepLogic: Send {
    fn process(&mut self, input: usize, record: Record, out: &mut Vec<Record>) -> Result<()>;

    /// Se llama una vez, después del último registro.
    fn finish(&mut self, _out: &mut Vec<Record>) -> Result<()> {
        Ok(())
    }
}

/// Registro → partición destino.
pub trait RecordPartitioner: Send + Sync {
    fn partition(&self, input: usize, record: &[u8], count: u32) -> Result<PartitionId>;
}

pub type StepFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn StepLogic>> + Send + Sync>;

/// Resuelve artefactos a instancias de lógica y nombres a particionadores.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, StepFactory>,
    partitioners: HashMap<String, Arc<dyn RecordPartitioner>>,
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<&String> = self.steps.keys().collect();
        steps.sort();
        let mut parts: Vec<&String> = self.partitioners.keys().collect();
        parts.sort();
        f.debug_struct("StepRegistry")
            .field("steps", &steps)
            .field("partitioners", &parts)
            .finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con los steps nativos incluidos en `engine`.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        engine::register_builtins(&mut r);
        r
    }

    pub fn register_step<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn StepLogic>> + Send + Sync + 'static,
    {
        self.steps.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_partitioner<P>(&mut self, name: &str, partitioner: P)
    where
        P: RecordPartitioner + 'static,
    {
        self.partitioners
            .insert(name.to_string(), Arc::new(partitioner));
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn instantiate(&self, artifact: &StepArtifact) -> Result<Box<dyn StepLogic>> {
        match &artifact.kind {
            LogicKind::Native => {
                let factory = self.steps.get(&artifact.id).ok_or_else(|| {
                    FlowError::StepLogic(format!("step nativo no registrado: {}", artifact.id))
                })?;
                factory(&artifact.params)
            }
            LogicKind::Interpreter { command } => Ok(Box::new(PipeLogic::spawn(&format!(
                "{command} {}",
                artifact.id
            ))?)),
            LogicKind::Process { command } => Ok(Box::new(PipeLogic::spawn(command)?)),
        }
    }

    /// Instancia una cadena fusionada; con una sola etapa no hay envoltorio.
    pub fn chain(&self, artifacts: &[StepArtifact]) -> Result<Box<dyn StepLogic>> {
        match artifacts {
            [] => Err(FlowError::StepLogic("cadena de steps vacía".to_string())),
            [single] => self.instantiate(single),
            many => {
                let stages = many
                    .iter()
                    .map(|a| self.instantiate(a))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Box::new(ChainLogic::new(stages)))
            }
        }
    }

    /// `None` para pass-through.
    pub fn partitioner(&self, spec: &PartitionerSpec) -> Result<Option<Arc<dyn RecordPartitioner>>> {
        Ok(match spec {
            PartitionerSpec::None => None,
            PartitionerSpec::Hash { keys } => Some(Arc::new(HashPartitioner::new(keys.clone())?)),
            PartitionerSpec::Range { key, bounds } => {
                Some(Arc::new(RangePartitioner::new(key, bounds.clone())))
            }
            PartitionerSpec::Custom { name } => {
                let p = self.partitioners.get(name).ok_or_else(|| {
                    FlowError::InvalidGraph(format!("particionador no registrado: {name}"))
                })?;
                Some(p.clone())
            }
        })
    }
}

/// Cadena de etapas fusionadas: la salida de cada etapa alimenta a la
/// siguiente en orden de producción; `finish` se propaga en cascada.
pub struct ChainLogic {
    stages: Vec<Box<dyn StepLogic>>,
}

impl ChainLogic {
    pub fn new(stages: Vec<Box<dyn StepLogic>>) -> Self {
        Self { stages }
    }

    fn feed(&mut self, from: usize, mut batch: Vec<Record>, out: &mut Vec<Record>) -> Result<()> {
        for stage in self.stages.iter_mut().skip(from) {
            if batch.is_empty() {
                return Ok(());
            }
            let mut next = Vec::with_capacity(batch.len());
            for record in batch {
                stage.process(0, record, &mut next)?;
            }
            batch = next;
        }
        out.extend(batch);
        Ok(())
    }
}

impl StepLogic for ChainLogic {
    fn process(&mut self, input: usize, record: Record, out: &mut Vec<Record>) -> Result<()> {
        let Some(first) = self.stages.first_mut() else {
            return Ok(());
        };
        let mut produced = Vec::new();
        first.process(input, record, &mut produced)?;
        self.feed(1, produced, out)
    }

    fn finish(&mut self, out: &mut Vec<Record>) -> Result<()> {
        for i in 0..self.stages.len() {
            let mut flushed = Vec::new();
            self.stages[i].finish(&mut flushed)?;
            self.feed(i + 1, flushed, out)?;
        }
        Ok(())
    }
}
