//! Resource sampling for the supervised child.
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Interval between two samples.
pub const SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// One resource sample of a process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    /// Resident memory relative to total system memory.
    pub memory_percent: f32,
    /// CPU usage since the previous sample, 100 per saturated core.
    pub cpu_percent: f32,
}

/// Samples one process. Only available where `sysinfo` supports the platform.
pub struct ProcessSampler {
    system: System,
    pid: Pid,
    total_memory: u64,
}

impl ProcessSampler {
    /// Returns `None` when process metrics are unavailable or the process is gone.
    pub fn attach(pid: u32) -> Option<Self> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return None;
        }
        let mut system = System::new();
        system.refresh_memory();
        let mut sampler = Self {
            total_memory: system.total_memory(),
            system,
            pid: Pid::from_u32(pid),
        };
        // Primes the CPU counters so the first reported sample is meaningful.
        sampler.sample()?;
        Some(sampler)
    }

    /// Takes a sample, `None` once the process can no longer be observed.
    pub fn sample(&mut self) -> Option<MetricSample> {
        let pids = [self.pid];
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let process = self.system.process(self.pid)?;
        let memory_bytes = process.memory();
        let memory_percent = if self.total_memory == 0 {
            0.0
        } else {
            (memory_bytes as f64 / self.total_memory as f64 * 100.0) as f32
        };
        Some(MetricSample {
            memory_bytes,
            memory_percent,
            cpu_percent: process.cpu_usage(),
        })
    }
}
