//! Resource monitoring - Host and per-process resource sampling

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::resource::{ResourceUsage, SystemResources};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::trace;

/// Samples CPU and memory for the host and for supervised PIDs
pub struct ResourceMonitor {
    system: System,
    last_update: Option<Instant>,
    /// Minimum time between refreshes
    update_interval: Duration,
}

impl ResourceMonitor {
    pub fn new(update_interval: Duration) -> Self {
        Self {
            system: System::new(),
            last_update: None,
            update_interval,
        }
    }

    /// Refresh host figures and the given processes, rate limited
    pub fn refresh(&mut self, pids: &[u32]) {
        let now = Instant::now();
        if let Some(last) = self.last_update {
            if now.duration_since(last) < self.update_interval {
                return;
            }
        }

        self.system
            .refresh_cpu_specifics(CpuRefreshKind::new().with_cpu_usage());
        self.system
            .refresh_memory_specifics(MemoryRefreshKind::new().with_ram());
        let pids: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::new()
                .with_cpu()
                .with_memory()
                .with_disk_usage(),
        );

        self.last_update = Some(now);
        trace!("Resource monitor refreshed for {} processes", pids.len());
    }

    pub fn get_system_resources(&self) -> SystemResources {
        SystemResources {
            cpu_percent: self.system.global_cpu_usage(),
            cpu_cores: self.system.cpus().len(),
            total_memory: self.system.total_memory(),
            used_memory: self.system.used_memory(),
            available_memory: self.system.available_memory(),
            uptime_secs: System::uptime(),
        }
    }

    /// Resource usage for a specific process, if it is known
    pub fn get_process_usage(&self, pid: u32) -> Option<ResourceUsage> {
        let process = self.system.process(Pid::from_u32(pid))?;
        let disk = process.disk_usage();

        Some(ResourceUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            disk_read_bytes: disk.read_bytes,
            disk_write_bytes: disk.written_bytes,
        })
    }

    /// Combined usage of an engine/router pair
    pub fn get_pair_usage(&self, pid_engine: u32, pid_router: u32) -> Option<ResourceUsage> {
        match (
            self.get_process_usage(pid_engine),
            self.get_process_usage(pid_router),
        ) {
            (Some(e), Some(r)) => Some(e.combine(&r)),
            (Some(u), None) | (None, Some(u)) => Some(u),
            (None, None) => None,
        }
    }
}

/// Thread-safe wrapper for ResourceMonitor
pub struct SharedResourceMonitor {
    inner: Arc<RwLock<ResourceMonitor>>,
}

impl SharedResourceMonitor {
    pub fn new(update_interval: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ResourceMonitor::new(update_interval))),
        }
    }

    pub fn refresh(&self, pids: &[u32]) {
        if let Ok(mut monitor) = self.inner.write() {
            monitor.refresh(pids);
        }
    }

    pub fn get_system_resources(&self) -> SystemResources {
        self.inner
            .read()
            .map(|m| m.get_system_resources())
            .unwrap_or_default()
    }

    pub fn get_pair_usage(&self, pid_engine: u32, pid_router: u32) -> Option<ResourceUsage> {
        self.inner.read().ok()?.get_pair_usage(pid_engine, pid_router)
    }
}

impl Clone for SharedResourceMonitor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
