//! Error types for instance management

use std::path::PathBuf;

use super::instance::{InstanceId, InstanceState};

/// Errors returned by the lifecycle manager to API callers
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Unknown engine type: {0}")]
    UnknownEngine(String),
    #[error("Unknown aircraft type '{aircraft}' for engine {engine}")]
    UnknownAircraft { engine: String, aircraft: String },
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Instance {id} failed to start: {reason}")]
    SpawnFailed { id: InstanceId, reason: String },
    #[error("Instance {0} not found")]
    NotFound(InstanceId),
    #[error("Instance {id} is {state}, stop it before removing")]
    StillActive { id: InstanceId, state: InstanceState },
    #[error("Illegal transition for instance {id}: {from} -> {to}")]
    InvalidTransition {
        id: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },
}

impl ManagerError {
    /// Validation errors come straight from user input
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::UnknownEngine(_) | Self::UnknownAircraft { .. })
    }
}

/// Reasons a supervised process could not be brought up
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Working directory missing: {}", .0.display())]
    WorkingDirMissing(PathBuf),
    #[error("{process} exited during startup ({status}){detail}")]
    EarlyExit {
        process: String,
        status: String,
        detail: String,
    },
    #[error("Failed to spawn {process}: {source}")]
    Io {
        process: String,
        #[source]
        source: std::io::Error,
    },
}

/// Port allocation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("No free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}
