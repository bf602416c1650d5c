use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result};
use crate::{DatasetId, FlowId, Record, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFailure {
    pub kind: ErrorKind,
    pub task: Option<TaskId>,
    pub dataset: Option<DatasetId>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub regions: u32,
    pub tasks: u32,
    /// Regiones lanzadas, incluyendo reintentos y recómputos.
    pub region_runs: u32,
    pub failed_runs: u32,
    pub recomputed_regions: u32,
    pub records_out: u64,
}

/// Resultado de correr un flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub flow_id: FlowId,
    pub status: FlowStatus,
    pub failure: Option<FlowFailure>,
    /// Por cada dataset sink, sus particiones en orden.
    pub outputs: BTreeMap<DatasetId, Vec<Vec<Record>>>,
    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == FlowStatus::Succeeded
    }

    /// Registros del sink, concatenando particiones.
    pub fn records(&self, dataset: DatasetId) -> Vec<&Record> {
        self.outputs
            .get(&dataset)
            .map(|parts| parts.iter().flatten().collect())
            .unwrap_or_default()
    }

    pub fn json_records(&self, dataset: DatasetId) -> Result<Vec<Value>> {
        self.records(dataset)
            .into_iter()
            .map(|r| serde_json::from_slice(r).map_err(Into::into))
            .collect()
    }
}
