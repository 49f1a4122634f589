//! Core module - Instance lifecycle, process supervision, and resource monitoring

mod engine;
mod error;
mod instance;
mod manager;
mod monitor;
mod ports;
mod process;
mod registry;
pub mod resource;
pub mod settings;

pub use engine::{AircraftSpec, AircraftSummary, EngineCatalog, EngineSettings, EngineType, RouterSettings};
pub use error::{AllocatorError, ManagerError, SpawnError};
pub use instance::{ConnectionInfo, Instance, InstanceDescriptor, InstanceId, InstanceState};
pub use manager::{EngineStatus, LifecycleManager, PortStatus, ReconcileReport, SystemStatus};
pub use ports::PortAllocator;
pub use process::{ExitInfo, Observation, ProcessSpec, ProcessSupervisor, TerminateOutcome};
pub use resource::{ResourceUsage, SystemResources};
pub use settings::Settings;
