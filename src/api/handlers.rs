use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use super::error::ApiError;
use super::AppState;
use crate::core::{AircraftSummary, InstanceDescriptor, InstanceId, SystemStatus};

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(default = "default_engine")]
    pub engine: String,
    pub aircraft_type: Option<String>,
}

fn default_engine() -> String {
    "px4".to_string()
}

/// Reply to create, stop and remove
#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceActionResponse {
    pub success: bool,
    pub instance_id: InstanceId,
    pub message: String,
    pub instance: InstanceDescriptor,
}

fn parse_id(raw: &str) -> Result<InstanceId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid instance id '{}'", raw)))
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(manager): State<AppState>) -> Json<SystemStatus> {
    Json(manager.system_status())
}

pub async fn list_engines(
    State(manager): State<AppState>,
) -> Json<BTreeMap<String, Vec<AircraftSummary>>> {
    Json(manager.list_engines())
}

pub async fn list_instances(State(manager): State<AppState>) -> Json<Vec<InstanceDescriptor>> {
    let instances = manager.list();
    Json(instances.iter().map(|i| manager.describe(i)).collect())
}

pub async fn create_instance(
    State(manager): State<AppState>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceActionResponse>), ApiError> {
    let aircraft = request
        .aircraft_type
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("aircraft_type is required".to_string()))?;
    info!(
        "API: create instance engine={} aircraft={}",
        request.engine, aircraft
    );

    let instance = manager
        .create(&request.engine, &aircraft)
        .await
        .inspect_err(|e| error!("Error starting instance: {}", e))?;

    Ok((
        StatusCode::CREATED,
        Json(InstanceActionResponse {
            success: true,
            instance_id: instance.id,
            message: format!(
                "Started {} instance with {} on port {}",
                instance.engine_type, instance.aircraft_type, instance.port
            ),
            instance: manager.describe(&instance),
        }),
    ))
}

pub async fn get_instance(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceDescriptor>, ApiError> {
    let instance = manager.get(parse_id(&id)?)?;
    Ok(Json(manager.describe(&instance)))
}

pub async fn stop_instance(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceActionResponse>, ApiError> {
    let id = parse_id(&id)?;
    info!("API: stop instance {}", id);
    let instance = manager.stop(id).await?;
    Ok(Json(InstanceActionResponse {
        success: true,
        instance_id: id,
        message: format!("Stopped instance {}", id),
        instance: manager.describe(&instance),
    }))
}

pub async fn remove_instance(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceActionResponse>, ApiError> {
    let id = parse_id(&id)?;
    let instance = manager.remove(id).await?;
    Ok(Json(InstanceActionResponse {
        success: true,
        instance_id: id,
        message: format!("Removed instance {}", id),
        instance: manager.describe(&instance),
    }))
}
