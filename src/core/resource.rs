//! Resource usage snapshots for instances and the host

use serde::{Deserialize, Serialize};

/// Resource usage of an instance's process pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage percentage (may exceed 100 on multi-core hosts)
    pub cpu_percent: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// Virtual memory in bytes
    pub virtual_memory_bytes: u64,
    /// Disk bytes read since the last sample
    pub disk_read_bytes: u64,
    /// Disk bytes written since the last sample
    pub disk_write_bytes: u64,
}

impl ResourceUsage {
    /// Sum of two samples (engine + router)
    pub fn combine(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: self.cpu_percent + other.cpu_percent,
            memory_bytes: self.memory_bytes + other.memory_bytes,
            virtual_memory_bytes: self.virtual_memory_bytes + other.virtual_memory_bytes,
            disk_read_bytes: self.disk_read_bytes + other.disk_read_bytes,
            disk_write_bytes: self.disk_write_bytes + other.disk_write_bytes,
        }
    }

    /// Format memory as human-readable string
    pub fn memory_string(&self) -> String {
        format_bytes(self.memory_bytes)
    }

    /// Format CPU percentage
    pub fn cpu_string(&self) -> String {
        format!("{:.1}%", self.cpu_percent)
    }
}

/// Host-wide resource information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemResources {
    /// Total CPU usage percentage
    pub cpu_percent: f32,
    /// Number of CPU cores
    pub cpu_cores: usize,
    /// Total physical memory in bytes
    pub total_memory: u64,
    /// Used physical memory in bytes
    pub used_memory: u64,
    /// Available physical memory in bytes
    pub available_memory: u64,
    /// System uptime in seconds
    pub uptime_secs: u64,
}

impl SystemResources {
    /// Memory usage percentage
    pub fn memory_percent(&self) -> f32 {
        if self.total_memory > 0 {
            (self.used_memory as f32 / self.total_memory as f32) * 100.0
        } else {
            0.0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
