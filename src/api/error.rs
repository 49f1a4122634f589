use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::core::{InstanceId, ManagerError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Manager(e) => match e {
                ManagerError::UnknownEngine(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_ENGINE"),
                ManagerError::UnknownAircraft { .. } => {
                    (StatusCode::BAD_REQUEST, "UNKNOWN_AIRCRAFT")
                }
                ManagerError::ResourceExhausted(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "RESOURCE_EXHAUSTED")
                }
                ManagerError::SpawnFailed { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "SPAWN_FAILED")
                }
                ManagerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ManagerError::StillActive { .. } => (StatusCode::CONFLICT, "STILL_ACTIVE"),
                ManagerError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "INVALID_TRANSITION")
                }
            },
        };

        let instance_id: Option<InstanceId> = match &self {
            ApiError::Manager(ManagerError::SpawnFailed { id, .. })
            | ApiError::Manager(ManagerError::NotFound(id))
            | ApiError::Manager(ManagerError::StillActive { id, .. }) => Some(*id),
            _ => None,
        };

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
            "code": code,
            "instance_id": instance_id,
        }));
        (status, body).into_response()
    }
}
