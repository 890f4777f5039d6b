//! Process usage sampling
//!
//! Samples this process's memory and CPU usage for the periodic status and
//! metrics events. The numbers are advisory observability data; sampling
//! failures degrade to zeroed readings rather than errors.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// One usage sample of the agent process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessUsage {
    /// Resident set size, in bytes.
    pub memory: u64,
    /// Virtual memory size, in bytes.
    pub virtual_memory: u64,
    /// CPU usage percentage since the previous sample.
    pub cpu: f64,
}

/// Samples the current process through the OS process table.
pub struct ProcessMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Take a usage sample. Returns zeroed readings if the process cannot
    /// be found.
    pub fn sample(&self) -> ProcessUsage {
        let Some(pid) = self.pid else {
            return ProcessUsage::default();
        };

        let mut system = self.system.lock();
        system.refresh_process_specifics(pid, ProcessRefreshKind::everything());
        match system.process(pid) {
            Some(process) => ProcessUsage {
                memory: process.memory(),
                virtual_memory: process.virtual_memory(),
                cpu: f64::from(process.cpu_usage()),
            },
            None => ProcessUsage::default(),
        }
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Unix time in seconds.
pub fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Unix time in milliseconds.
pub fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
