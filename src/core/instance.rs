//! Instance management - Represents a single simulator instance

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::engine::EngineType;
use super::error::ManagerError;
use super::resource::ResourceUsage;

/// Unique identifier for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of an instance
///
/// `Starting -> Running -> Stopping -> Stopped`, with `Failed` reachable
/// from `Starting` or `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Port allocated, processes being spawned
    Starting,
    /// Both processes confirmed up
    Running,
    /// Termination requested, waiting for processes to exit
    Stopping,
    /// Both processes terminated, port released
    Stopped,
    /// Startup failed or a process died unexpectedly
    Failed,
}

impl InstanceState {
    /// States that still hold a port and supervised processes
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown instance state '{}'", other)),
        }
    }
}

/// A managed engine + telemetry router pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier
    pub id: InstanceId,
    /// Simulator backend
    pub engine_type: EngineType,
    /// Vehicle model passed to the engine
    pub aircraft_type: String,
    /// Externally reachable telemetry port, owned for the instance lifetime
    pub port: u16,
    /// Current lifecycle state
    pub state: InstanceState,
    /// Engine process ID
    pub pid_engine: Option<u32>,
    /// Telemetry router process ID
    pub pid_router: Option<u32>,
    /// Per-instance working directory (logs, engine scratch data)
    pub working_dir: PathBuf,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// When both processes were confirmed up
    pub started_at: Option<DateTime<Utc>>,
    /// When the instance reached a terminal state
    pub stopped_at: Option<DateTime<Utc>>,
    /// Failure detail, only set in `Failed`
    pub last_error: Option<String>,
    /// Latest resource sample for the process pair
    #[serde(skip)]
    pub resources: Option<ResourceUsage>,
}

impl Instance {
    pub fn new(
        engine_type: EngineType,
        aircraft_type: impl Into<String>,
        port: u16,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::with_id(InstanceId::new(), engine_type, aircraft_type, port, working_dir)
    }

    pub fn with_id(
        id: InstanceId,
        engine_type: EngineType,
        aircraft_type: impl Into<String>,
        port: u16,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            engine_type,
            aircraft_type: aircraft_type.into(),
            port,
            state: InstanceState::Starting,
            pid_engine: None,
            pid_router: None,
            working_dir: working_dir.into(),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_error: None,
            resources: None,
        }
    }

    fn transition(&mut self, next: InstanceState) -> Result<(), ManagerError> {
        if !self.state.can_transition_to(next) {
            return Err(ManagerError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Both processes are up
    pub fn mark_running(&mut self, pid_engine: u32, pid_router: u32) -> Result<(), ManagerError> {
        self.transition(InstanceState::Running)?;
        self.pid_engine = Some(pid_engine);
        self.pid_router = Some(pid_router);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_stopping(&mut self) -> Result<(), ManagerError> {
        self.transition(InstanceState::Stopping)
    }

    pub fn mark_stopped(&mut self) -> Result<(), ManagerError> {
        self.transition(InstanceState::Stopped)?;
        self.stopped_at = Some(Utc::now());
        self.resources = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), ManagerError> {
        self.transition(InstanceState::Failed)?;
        self.stopped_at = Some(Utc::now());
        self.last_error = Some(error.into());
        self.resources = None;
        Ok(())
    }

    /// Force a record left behind by a previous manager run into `Failed`
    ///
    /// Its processes are no longer supervised, so the normal transition rules
    /// do not apply.
    pub fn abandon(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = InstanceState::Failed;
        self.stopped_at = Some(Utc::now());
        self.last_error = Some(reason.into());
        self.resources = None;
    }

    /// Time spent running; frozen once the instance stops
    pub fn uptime(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.stopped_at.unwrap_or_else(Utc::now);
        Some((end - started).max(Duration::zero()))
    }

    /// Whether a terminal record has outlived the retention window
    pub fn is_expired(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        match (self.state.is_terminal(), self.stopped_at) {
            (true, Some(stopped)) => now - stopped >= retention,
            _ => false,
        }
    }

    pub fn descriptor(&self, public_host: &str) -> InstanceDescriptor {
        InstanceDescriptor {
            id: self.id,
            engine_type: self.engine_type,
            aircraft_type: self.aircraft_type.clone(),
            port: self.port,
            state: self.state,
            uptime: self.uptime().map(|d| d.num_seconds()),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            connection: ConnectionInfo {
                host: public_host.to_string(),
                port: self.port,
                protocol: "UDP".to_string(),
            },
            resources: self.resources.clone(),
        }
    }
}

/// Where a ground-control client connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

/// Public view of an instance returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: InstanceId,
    pub engine_type: EngineType,
    pub aircraft_type: String,
    pub port: u16,
    pub state: InstanceState,
    /// Seconds since the instance reached `Running`
    pub uptime: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub connection: ConnectionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceUsage>,
}
