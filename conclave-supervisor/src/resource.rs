//! CPU and memory sampling for node processes

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{Pid, System};

/// Point-in-time resource usage of one process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage since the previous sample, in percent of one core
    pub cpu_percent: f32,
    /// Resident memory in MiB
    pub memory_mb: f64,
}

/// Samples per-process usage through `sysinfo`.
///
/// CPU usage is relative to the previous refresh of the same process, so the
/// first sample of a new process reads zero.
#[derive(Debug, Default)]
pub struct ResourceSampler {
    system: Mutex<System>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Usage of `pid`, or `None` if the process is gone
    pub fn sample(&self, pid: u32) -> Option<ResourceUsage> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().ok()?;
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| ResourceUsage {
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_current_process() {
        let sampler = ResourceSampler::new();
        let usage = sampler.sample(std::process::id()).unwrap();
        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[test]
    fn test_sample_missing_process() {
        let sampler = ResourceSampler::new();
        assert!(sampler.sample(u32::MAX - 1).is_none());
    }
}
