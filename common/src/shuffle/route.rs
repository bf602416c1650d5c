use std::{fmt, sync::Arc};

use crate::error::Result;
use crate::steps::{RecordPartitioner, StepRegistry};
use crate::task::Route;
use crate::PartitionId;

/// Aplica un `Route`: deja pasar sólo los registros destinados a `target`.
#[derive(Clone)]
pub struct RouteFilter {
    partitioner: Arc<dyn RecordPartitioner>,
    input_index: usize,
    target: PartitionId,
    count: u32,
}

impl fmt::Debug for RouteFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteFilter")
            .field("input_index", &self.input_index)
            .field("target", &self.target)
            .field("count", &self.count)
            .finish()
    }
}

impl RouteFilter {
    /// `None` si la ruta es pass-through.
    pub fn from_route(route: &Route, registry: &StepRegistry) -> Result<Option<Self>> {
        Ok(registry
            .partitioner(&route.partitioner)?
            .map(|partitioner| Self {
                partitioner,
                input_index: route.input_index,
                target: route.target,
                count: route.target_count,
            }))
    }

    pub fn accepts(&self, record: &[u8]) -> Result<bool> {
        Ok(self
            .partitioner
            .partition(self.input_index, record, self.count)?
            == self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::PartitionerSpec;

    #[test]
    fn cada_registro_pasa_por_exactamente_un_destino() {
        let registry = StepRegistry::with_builtins();
        let filters: Vec<RouteFilter> = (0..3)
            .map(|target| {
                RouteFilter::from_route(
                    &Route {
                        partitioner: PartitionerSpec::hash("k"),
                        input_index: 0,
                        target,
                        target_count: 3,
                    },
                    &registry,
                )
                .unwrap()
                .unwrap()
            })
            .collect();

        for k in ["a", "b", "c", "d", "e", "f"] {
            let rec = format!(r#"{{"k":"{k}"}}"#).into_bytes();
            let hits = filters.iter().filter(|f| f.accepts(&rec).unwrap()).count();
            assert_eq!(hits, 1, "clave {k}");
        }
    }

    #[test]
    fn ruta_sin_particionador_no_filtra() {
        let registry = StepRegistry::with_builtins();
        let f = RouteFilter::from_route(
            &Route {
                partitioner: PartitionerSpec::None,
                input_index: 0,
                target: 0,
                target_count: 1,
            },
            &registry,
        )
        .unwrap();
        assert!(f.is_none());
    }
}
