//! Manager settings - Port range, limits, timeouts and the engine catalog

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::engine::{EngineSettings, RouterSettings};

/// Manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // API
    /// Address the HTTP API binds to
    pub http_host: String,
    /// HTTP API port
    pub http_port: u16,
    /// Host name handed to clients in connection info
    pub public_host: String,

    // Resources
    /// First telemetry port handed out (inclusive)
    pub port_range_start: u16,
    /// Last telemetry port handed out (inclusive)
    pub port_range_end: u16,
    /// Maximum concurrently live instances (0 = bounded by the port range only)
    pub max_instances: u32,

    // Timing
    /// Grace period between SIGTERM and SIGKILL
    pub grace_period_secs: u64,
    /// How long stopped/failed records stay queryable
    pub retention_secs: u64,
    /// Reconciliation poll interval in ms
    pub reconcile_interval_ms: u64,
    /// A process must stay up this long to count as started (ms)
    pub startup_window_ms: u64,
    /// Consecutive failed liveness polls before an instance is declared failed
    pub observation_failure_threshold: u32,
    /// Resource monitor update interval in ms
    pub monitor_interval_ms: u64,

    // Storage
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Persist instance records in SQLite
    pub persist: bool,
    /// Keep instance history for N days (0 = forever)
    pub history_retention_days: u32,

    // Engines
    pub engines: Vec<EngineSettings>,
    pub router: RouterSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // API
            http_host: "0.0.0.0".to_string(),
            http_port: 5000,
            public_host: "0.0.0.0".to_string(),

            // Resources
            port_range_start: 14550,
            port_range_end: 14599,
            max_instances: 0,

            // Timing
            grace_period_secs: 5,
            retention_secs: 300,
            reconcile_interval_ms: 5000,
            startup_window_ms: 3000,
            observation_failure_threshold: 3,
            monitor_interval_ms: 1000,

            // Storage
            data_directory: None,
            persist: true,
            history_retention_days: 30,

            // Engines
            engines: vec![EngineSettings::px4("sitl_engines/px4/PX4-Autopilot")],
            router: RouterSettings::default(),
        }
    }
}

/// Environment overrides, applied on top of the settings file
#[derive(Envconfig, Debug)]
pub struct EnvOverrides {
    #[envconfig(from = "SITL_CONFIG")]
    pub config_file: Option<PathBuf>,
    #[envconfig(from = "SITL_HTTP_HOST")]
    pub http_host: Option<String>,
    #[envconfig(from = "SITL_HTTP_PORT")]
    pub http_port: Option<u16>,
    #[envconfig(from = "SITL_PUBLIC_HOST")]
    pub public_host: Option<String>,
    #[envconfig(from = "SITL_PORT_START")]
    pub port_range_start: Option<u16>,
    #[envconfig(from = "SITL_PORT_END")]
    pub port_range_end: Option<u16>,
    #[envconfig(from = "SITL_MAX_INSTANCES")]
    pub max_instances: Option<u32>,
    #[envconfig(from = "SITL_GRACE_PERIOD_SECS")]
    pub grace_period_secs: Option<u64>,
    #[envconfig(from = "SITL_RETENTION_SECS")]
    pub retention_secs: Option<u64>,
    #[envconfig(from = "SITL_DATA_DIR")]
    pub data_directory: Option<PathBuf>,
    #[envconfig(from = "SITL_PX4_PATH")]
    pub px4_path: Option<PathBuf>,
}

impl Settings {
    /// Settings file named by `SITL_CONFIG` (if any) plus environment overrides
    pub fn from_env() -> Result<Self> {
        let overrides = EnvOverrides::init_from_env().context("Invalid SITL_* environment")?;
        let mut settings = match &overrides.config_file {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };
        settings.apply(overrides);
        settings.validate();
        Ok(settings)
    }

    /// Parse a TOML settings file; missing keys fall back to defaults
    pub fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: Settings = toml::from_str(&text)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn apply(&mut self, env: EnvOverrides) {
        if let Some(v) = env.http_host {
            self.http_host = v;
        }
        if let Some(v) = env.http_port {
            self.http_port = v;
        }
        if let Some(v) = env.public_host {
            self.public_host = v;
        }
        if let Some(v) = env.port_range_start {
            self.port_range_start = v;
        }
        if let Some(v) = env.port_range_end {
            self.port_range_end = v;
        }
        if let Some(v) = env.max_instances {
            self.max_instances = v;
        }
        if let Some(v) = env.grace_period_secs {
            self.grace_period_secs = v;
        }
        if let Some(v) = env.retention_secs {
            self.retention_secs = v;
        }
        if let Some(v) = env.data_directory {
            self.data_directory = Some(v);
        }
        if let Some(path) = env.px4_path {
            for engine in self
                .engines
                .iter_mut()
                .filter(|e| e.engine == super::EngineType::Px4)
            {
                engine.working_dir = Some(path.clone());
            }
        }
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        if self.port_range_start > self.port_range_end {
            std::mem::swap(&mut self.port_range_start, &mut self.port_range_end);
        }
        self.port_range_start = self.port_range_start.max(1);
        self.port_range_end = self.port_range_end.max(self.port_range_start);
        self.reconcile_interval_ms = self.reconcile_interval_ms.max(100);
        self.monitor_interval_ms = self.monitor_interval_ms.max(100);
        self.observation_failure_threshold = self.observation_failure_threshold.max(1);
        // Later entries for the same engine would be shadowed; keep the first
        let mut seen = Vec::new();
        self.engines.retain(|e| {
            if seen.contains(&e.engine) {
                false
            } else {
                seen.push(e.engine);
                true
            }
        });
    }

    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sitl-manager")
        })
    }

    /// Get the per-instance working directory root
    pub fn get_instances_directory(&self) -> PathBuf {
        self.get_data_directory().join("instances")
    }

    pub fn get_database_path(&self) -> PathBuf {
        self.get_data_directory().join("sitl-manager.db")
    }

    /// Live-instance cap, never above the port range size
    pub fn effective_max_instances(&self) -> usize {
        let range = (self.port_range_end - self.port_range_start) as usize + 1;
        match self.max_instances {
            0 => range,
            n => (n as usize).min(range),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_window_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
