use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};

/// Muestreo del uso real de los procesos executor (RSS y CPU sumados).
pub struct UsageSampler {
    sys: System,
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// `(memoria en MB, % de CPU)` sumados sobre `pids`. Los procesos que ya
    /// no existen se ignoran.
    pub fn sample(&mut self, pids: &[u32]) -> (u64, f32) {
        let mut mem_bytes: u64 = 0;
        let mut cpu = 0.0f32;
        for &raw in pids {
            let pid = Pid::from_u32(raw);
            if !self.sys.refresh_process(pid) {
                continue;
            }
            if let Some(p) = self.sys.process(pid) {
                mem_bytes += p.memory();
                cpu += p.cpu_usage();
            }
        }
        (mem_bytes / (1024 * 1024), cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn el_propio_proceso_usa_memoria() {
        let mut s = UsageSampler::new();
        let (mem, _) = s.sample(&[std::process::id()]);
        assert!(mem > 0);
        assert_eq!(s.sample(&[]), (0, 0.0));
    }
}
