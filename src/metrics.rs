//! Process resource sampling for heartbeat telemetry.

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One sample of the current process's resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessMetrics {
    /// CPU usage percentage; can exceed 100 on multi-core hosts
    pub cpu_percent: f32,
    /// Resident memory in MB
    pub memory_mb: u64,
}

/// Source of process metrics consumed by the heartbeat publisher
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> ProcessMetrics;
}

/// Samples the current process through sysinfo.
///
/// The `System` is kept between samples because sysinfo derives CPU usage
/// from the difference between two refreshes; the first sample reports 0.
pub struct SysinfoMetrics {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoMetrics {
    fn sample(&self) -> ProcessMetrics {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        system
            .process(self.pid)
            .map(|p| ProcessMetrics {
                cpu_percent: p.cpu_usage(),
                memory_mb: p.memory() / 1024 / 1024,
            })
            .unwrap_or_default()
    }
}

/// Fixed metrics, for tests and demos
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMetrics(pub ProcessMetrics);

impl MetricsSource for StaticMetrics {
    fn sample(&self) -> ProcessMetrics {
        self.0
    }
}

/// Host name as reported by the OS, or "unknown"
pub fn hostname() -> String {
    System::host_name()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
