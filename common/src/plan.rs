use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::config::PlannerConfig;
use crate::dag::{FlowGraph, Persistence, SourceSpec, Step};
use crate::error::{FlowError, Result};
use crate::fusion::fuse;
use crate::task::{
    task_id, ConsumerSpec, Delivery, OutputSpec, Route, SourcePartition, TaskInput, TaskSpec,
    TaskWork,
};
use crate::{DatasetId, PartitionId, TaskId};

/// Conjunto de tareas unidas por entregas en streaming. Se agenda como una
/// unidad: todas sus tareas corren a la vez.
///
/// Cada dataset en streaming tiene un único consumidor, así que seguir las
/// aristas en streaming hacia abajo termina siempre en el mismo dataset
/// persistido: la raíz de la región.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: usize,
    pub root: DatasetId,
    /// Datasets de la región en orden topológico (la raíz al final).
    pub datasets: Vec<DatasetId>,
    pub tasks: Vec<TaskId>,
    /// Datasets persistidos de regiones anteriores que esta región lee.
    pub inputs: Vec<DatasetId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    /// Grafo tras fusión y resolución de particiones.
    pub graph: FlowGraph,
    pub tasks: Vec<TaskSpec>,
    /// En orden de ejecución.
    pub regions: Vec<Region>,
    pub delivery: BTreeMap<DatasetId, Delivery>,
}

impl PhysicalPlan {
    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn tasks_of(&self, dataset: DatasetId) -> Vec<&TaskSpec> {
        self.tasks.iter().filter(|t| t.dataset == dataset).collect()
    }

    pub fn delivery_of(&self, dataset: DatasetId) -> Delivery {
        self.delivery
            .get(&dataset)
            .copied()
            .unwrap_or(Delivery::Staged)
    }

    /// Región que produce `dataset`.
    pub fn region_of(&self, dataset: DatasetId) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.datasets.contains(&dataset))
    }

    /// Regiones que leen `dataset` como entrada persistida.
    pub fn consuming_regions(&self, dataset: DatasetId) -> Vec<usize> {
        self.regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.inputs.contains(&dataset))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn sinks(&self) -> Vec<DatasetId> {
        self.graph.sinks()
    }

    pub fn persistence_of(&self, dataset: DatasetId) -> Result<Persistence> {
        Ok(self.graph.dataset(dataset)?.persistence)
    }
}

impl FlowGraph {
    /// Compila con la configuración por defecto del planner.
    pub fn compile(&self) -> Result<PhysicalPlan> {
        compile(self, &PlannerConfig::default())
    }
}

/// Fusión → resolución de particiones → una tarea por partición → regiones.
pub fn compile(graph: &FlowGraph, cfg: &PlannerConfig) -> Result<PhysicalPlan> {
    graph.validate()?;

    let g = if cfg.fuse {
        fuse(graph)?
    } else {
        let mut g = graph.clone();
        g.resolve_partitions()?;
        g
    };

    let order = g.topological_order()?;
    let delivery = delivery_map(&g)?;

    let mut tasks = Vec::new();
    for ds_id in &order {
        let ds = g.dataset(*ds_id)?;
        let count = ds.partition_count()?;
        let step = g.producer_of(*ds_id);
        let output = OutputSpec {
            delivery: delivery[ds_id],
            persistence: ds.persistence,
            consumers: Vec::new(),
        };

        for p in 0..count {
            let (work, inputs, resources) = match (&ds.source, step) {
                (Some(src), _) => (
                    TaskWork::Source {
                        source: source_partition(src, p)?,
                    },
                    Vec::new(),
                    cfg.default_task_resource,
                ),
                (None, Some(step)) => (
                    TaskWork::Step {
                        step: step.id,
                        name: step.name.clone(),
                        op: step.op,
                        logic: step.logic.clone(),
                    },
                    task_inputs(&g, step, p, count, &delivery)?,
                    step.resources.unwrap_or(cfg.default_task_resource),
                ),
                (None, None) => {
                    return Err(FlowError::InvalidGraph(format!(
                        "el dataset {ds_id} no tiene productor"
                    )))
                }
            };

            let mut output = output.clone();
            if output.delivery == Delivery::Streamed {
                output.consumers = streamed_consumers(&g, *ds_id, p)?;
            }

            tasks.push(TaskSpec {
                id: task_id(*ds_id, p),
                dataset: *ds_id,
                partition: p,
                partition_count: count,
                work,
                inputs,
                output,
                resources,
            });
        }
    }

    let regions = build_regions(&g, &order, &delivery)?;

    Ok(PhysicalPlan {
        graph: g,
        tasks,
        regions,
        delivery,
    })
}

/// Streaming si es `memory` y lo lee exactamente un step, una sola vez.
fn delivery_map(g: &FlowGraph) -> Result<BTreeMap<DatasetId, Delivery>> {
    let mut out = BTreeMap::new();
    for ds in g.datasets.values() {
        let consumers = g.consumers_of(ds.id);
        let streamed = ds.persistence == Persistence::Memory
            && consumers.len() == 1
            && consumers[0].inputs.iter().filter(|i| **i == ds.id).count() == 1;
        out.insert(
            ds.id,
            if streamed {
                Delivery::Streamed
            } else {
                Delivery::Staged
            },
        );
    }
    Ok(out)
}

fn source_partition(src: &SourceSpec, p: PartitionId) -> Result<SourcePartition> {
    let missing = || FlowError::InvalidGraph(format!("el source no tiene partición {p}"));
    Ok(match src {
        SourceSpec::Inline { partitions } => SourcePartition::Inline {
            records: partitions.get(p as usize).cloned().ok_or_else(missing)?,
        },
        SourceSpec::TextFiles { paths } => SourcePartition::TextFile {
            path: paths.get(p as usize).cloned().ok_or_else(missing)?,
        },
    })
}

fn task_inputs(
    g: &FlowGraph,
    step: &Step,
    p: PartitionId,
    count: u32,
    delivery: &BTreeMap<DatasetId, Delivery>,
) -> Result<Vec<TaskInput>> {
    let mut inputs = Vec::with_capacity(step.inputs.len());
    for (i, input) in step.inputs.iter().enumerate() {
        let ds = g.dataset(*input)?;
        let (partitions, route) = if step.repartitions() {
            (
                (0..ds.partition_count()?).collect(),
                Some(Route {
                    partitioner: step.partitioner.clone(),
                    input_index: i,
                    target: p,
                    target_count: count,
                }),
            )
        } else {
            (vec![p], None)
        };
        inputs.push(TaskInput {
            input_index: i,
            dataset: *input,
            partitions,
            delivery: delivery[input],
            persistence: ds.persistence,
            route,
        });
    }
    Ok(inputs)
}

/// Consumidores de la partición `p` de un dataset en streaming.
fn streamed_consumers(g: &FlowGraph, ds: DatasetId, p: PartitionId) -> Result<Vec<ConsumerSpec>> {
    let consumers = g.consumers_of(ds);
    let [consumer] = consumers.as_slice() else {
        return Err(FlowError::InvalidGraph(format!(
            "el dataset {ds} se entrega en streaming pero no tiene un único consumidor"
        )));
    };
    let input_index = consumer
        .inputs
        .iter()
        .position(|i| *i == ds)
        .ok_or(FlowError::UnknownDataset(ds))?;
    let out = consumer.output;
    let out_count = g.dataset(out)?.partition_count()?;

    if consumer.repartitions() {
        Ok((0..out_count)
            .map(|q| ConsumerSpec {
                task: task_id(out, q),
                route: Some(Route {
                    partitioner: consumer.partitioner.clone(),
                    input_index,
                    target: q,
                    target_count: out_count,
                }),
            })
            .collect())
    } else {
        Ok(vec![ConsumerSpec {
            task: task_id(out, p),
            route: None,
        }])
    }
}

fn build_regions(
    g: &FlowGraph,
    order: &[DatasetId],
    delivery: &BTreeMap<DatasetId, Delivery>,
) -> Result<Vec<Region>> {
    let root_of = |mut ds: DatasetId| -> Result<DatasetId> {
        while delivery.get(&ds) == Some(&Delivery::Streamed) {
            ds = g
                .consumers_of(ds)
                .first()
                .map(|s| s.output)
                .ok_or(FlowError::UnknownDataset(ds))?;
        }
        Ok(ds)
    };

    let mut members: HashMap<DatasetId, Vec<DatasetId>> = HashMap::new();
    for ds in order {
        members.entry(root_of(*ds)?).or_default().push(*ds);
    }

    let mut regions = Vec::new();
    for root in order.iter().filter(|ds| delivery[*ds] == Delivery::Staged) {
        let datasets = members.remove(root).unwrap_or_default();

        let mut inputs: Vec<DatasetId> = Vec::new();
        for ds in &datasets {
            if let Some(step) = g.producer_of(*ds) {
                for input in &step.inputs {
                    if !datasets.contains(input) && !inputs.contains(input) {
                        inputs.push(*input);
                    }
                }
            }
        }

        let mut tasks = Vec::new();
        for ds in &datasets {
            for p in 0..g.dataset(*ds)?.partition_count()? {
                tasks.push(task_id(*ds, p));
            }
        }

        regions.push(Region {
            id: regions.len(),
            root: *root,
            datasets,
            tasks,
            inputs,
        });
    }
    Ok(regions)
}
