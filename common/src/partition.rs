use serde_json::Value;
use std::{
    cmp::Ordering,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use crate::engine::{canonical_key, compare_values};
use crate::error::{FlowError, Result};
use crate::steps::RecordPartitioner;
use crate::PartitionId;

/// Hash estable → partición. `DefaultHasher::new()` usa claves fijas, así que
/// dos procesos distintos rutean igual.
pub fn hash_key_to_partition(key: &[u8], count: u32) -> PartitionId {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % count.max(1) as u64) as PartitionId
}

/// Particiona por hash de una clave JSON. Con una sola clave se usa para
/// todas las entradas; si no, la clave i corresponde a la entrada i.
#[derive(Debug, Clone)]
pub struct HashPartitioner {
    keys: Vec<String>,
}

impl HashPartitioner {
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(FlowError::InvalidGraph(
                "el particionador hash necesita al menos una clave".to_string(),
            ));
        }
        Ok(Self { keys })
    }

    fn key_for(&self, input: usize) -> &str {
        self.keys
            .get(input)
            .or_else(|| self.keys.first())
            .map(String::as_str)
            .unwrap_or_default()
    }
}

impl RecordPartitioner for HashPartitioner {
    fn partition(&self, input: usize, record: &[u8], count: u32) -> Result<PartitionId> {
        // registros que no son JSON se rutean por sus bytes crudos
        let Ok(value) = serde_json::from_slice::<Value>(record) else {
            return Ok(hash_key_to_partition(record, count));
        };
        let key = value
            .get(self.key_for(input))
            .map(canonical_key)
            .unwrap_or_default();
        Ok(hash_key_to_partition(key.as_bytes(), count))
    }
}

/// Particiona por rangos ordenados: la partición es la cantidad de límites
/// menores o iguales a la clave, acotada a `count - 1`.
#[derive(Debug, Clone)]
pub struct RangePartitioner {
    key: String,
    bounds: Vec<Value>,
}

impl RangePartitioner {
    pub fn new(key: &str, mut bounds: Vec<Value>) -> Self {
        bounds.sort_by(compare_values);
        Self {
            key: key.to_string(),
            bounds,
        }
    }
}

impl RecordPartitioner for RangePartitioner {
    fn partition(&self, _input: usize, record: &[u8], count: u32) -> Result<PartitionId> {
        let value: Value = serde_json::from_slice(record)
            .map_err(|e| FlowError::StepLogic(format!("registro no es JSON: {e}")))?;
        let key = value.get(&self.key).cloned().unwrap_or(Value::Null);

        let idx = self
            .bounds
            .iter()
            .take_while(|b| compare_values(b, &key) != Ordering::Greater)
            .count() as u32;
        Ok(idx.min(count.saturating_sub(1)))
    }
}
