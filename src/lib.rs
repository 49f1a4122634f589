//! sitl-manager - Run multiple SITL flight-simulator instances on one host
//!
//! Each instance is a simulator engine plus a telemetry router bound to its
//! own port from a configured range. The manager starts, supervises and
//! stops these pairs and exposes them over a small HTTP API.

pub mod api;
pub mod core;
pub mod persistence;
pub mod platform;

/// Application name constant
pub const APP_NAME: &str = "sitl-manager";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
