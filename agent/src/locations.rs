use common::{DatasetId, FlowId, PartitionId, ShuffleDescriptor};
use std::collections::HashMap;

/// Ubicación de las particiones producidas en este nodo. Por partición se
/// guarda el intento más reciente.
#[derive(Debug, Default)]
pub struct LocationTable {
    entries: HashMap<(FlowId, DatasetId, PartitionId), ShuffleDescriptor>,
}

impl LocationTable {
    pub fn report(&mut self, desc: ShuffleDescriptor) {
        let key = (desc.flow_id.clone(), desc.dataset, desc.partition);
        match self.entries.get(&key) {
            Some(existing) if existing.attempt > desc.attempt => {}
            _ => {
                self.entries.insert(key, desc);
            }
        }
    }

    pub fn lookup(
        &self,
        flow_id: &str,
        dataset: DatasetId,
        partition: PartitionId,
    ) -> Option<&ShuffleDescriptor> {
        self.entries.get(&(flow_id.to_string(), dataset, partition))
    }

    pub fn remove_dataset(&mut self, flow_id: &str, dataset: DatasetId) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(f, d, _), _| !(f == flow_id && *d == dataset));
        before - self.entries.len()
    }

    pub fn remove_flow(&mut self, flow_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(f, _, _), _| f != flow_id);
        before - self.entries.len()
    }

    /// Datasets persistidos conocidos, para el GC.
    pub fn staged_datasets(&self) -> Vec<(FlowId, DatasetId)> {
        let mut out: Vec<(FlowId, DatasetId)> = self
            .entries
            .values()
            .filter(|d| d.staged)
            .map(|d| (d.flow_id.clone(), d.dataset))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Persistence;

    fn desc(ds: DatasetId, p: PartitionId, attempt: u32) -> ShuffleDescriptor {
        ShuffleDescriptor {
            flow_id: "f".to_string(),
            dataset: ds,
            partition: p,
            attempt,
            executor_id: format!("e{attempt}"),
            data_addr: "127.0.0.1:1".to_string(),
            persistence: Persistence::OnDisk,
            staged: true,
        }
    }

    #[test]
    fn intento_viejo_no_pisa_al_nuevo() {
        let mut t = LocationTable::default();
        t.report(desc(1, 0, 2));
        t.report(desc(1, 0, 1));
        assert_eq!(t.lookup("f", 1, 0).unwrap().attempt, 2);
        t.report(desc(1, 0, 3));
        assert_eq!(t.lookup("f", 1, 0).unwrap().attempt, 3);
    }

    #[test]
    fn borrar_dataset_y_flow() {
        let mut t = LocationTable::default();
        t.report(desc(1, 0, 0));
        t.report(desc(1, 1, 0));
        t.report(desc(2, 0, 0));
        assert_eq!(t.staged_datasets().len(), 2);
        assert_eq!(t.remove_dataset("f", 1), 2);
        assert!(t.lookup("f", 1, 0).is_none());
        assert_eq!(t.remove_flow("f"), 1);
        assert!(t.is_empty());
    }
}
