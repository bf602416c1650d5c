use serde::{Deserialize, Serialize};
use std::fmt;

/// Capacidad de un agente o requerimiento de una tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resource {
    /// Slots de ejecución (un executor ocupa al menos uno).
    pub slots: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl Resource {
    pub const fn new(slots: u32, memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            slots,
            memory_mb,
            disk_mb,
        }
    }

    /// ¿Cabe `req` dentro de `self`?
    pub fn fits(&self, req: &Resource) -> bool {
        self.slots >= req.slots && self.memory_mb >= req.memory_mb && self.disk_mb >= req.disk_mb
    }

    pub fn saturating_sub(&self, other: &Resource) -> Resource {
        Resource {
            slots: self.slots.saturating_sub(other.slots),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
        }
    }

    pub fn max(&self, other: &Resource) -> Resource {
        Resource {
            slots: self.slots.max(other.slots),
            memory_mb: self.memory_mb.max(other.memory_mb),
            disk_mb: self.disk_mb.max(other.disk_mb),
        }
    }

    /// Clave de orden para "capacidad restante": slots, luego memoria, luego disco.
    pub fn capacity_key(&self) -> (u32, u64, u64) {
        (self.slots, self.memory_mb, self.disk_mb)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slots={} mem={}MB disk={}MB",
            self.slots, self.memory_mb, self.disk_mb
        )
    }
}

/// Capacidad anunciada y porción consumida, tal como la lleva un agente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub capacity: Resource,
    pub used: Resource,
}

impl ResourceUsage {
    pub fn new(capacity: Resource) -> Self {
        Self {
            capacity,
            used: Resource::default(),
        }
    }

    pub fn free(&self) -> Resource {
        self.capacity.saturating_sub(&self.used)
    }

    /// Reserva `req` si cabe; si no, no toca nada y devuelve `false`.
    pub fn try_reserve(&mut self, req: &Resource) -> bool {
        if !self.free().fits(req) {
            return false;
        }
        self.used = self.used.saturating_add(req);
        true
    }

    pub fn release(&mut self, req: &Resource) {
        self.used = self.used.saturating_sub(req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_compara_todos_los_campos() {
        let cap = Resource::new(2, 1024, 100);
        assert!(cap.fits(&Resource::new(2, 1024, 100)));
        assert!(!cap.fits(&Resource::new(3, 10, 10)));
        assert!(!cap.fits(&Resource::new(1, 2048, 10)));
        assert!(!cap.fits(&Resource::new(1, 10, 101)));
    }

    #[test]
    fn reserve_and_release_keep_counters_in_range() {
        let mut usage = ResourceUsage::new(Resource::new(2, 512, 0));
        let req = Resource::new(1, 256, 0);

        assert!(usage.try_reserve(&req));
        assert!(usage.try_reserve(&req));
        assert!(!usage.try_reserve(&req));
        assert_eq!(usage.free(), Resource::new(0, 0, 0));

        usage.release(&req);
        usage.release(&req);
        usage.release(&req);
        assert_eq!(usage.free(), Resource::new(2, 512, 0));
    }
}
