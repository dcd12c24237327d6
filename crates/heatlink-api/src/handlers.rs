//! REST handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use heatlink_core::{Command, CommandSource, CoreError};

use crate::ApiState;

/// Handler error carrying the HTTP status it maps to.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: what.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::UnknownDevice(_) | CoreError::UnknownUnit(_) => StatusCode::NOT_FOUND,
            err if err.is_invalid_argument() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub type HandlerResult = Result<Json<serde_json::Value>, ApiError>;

fn ok(value: serde_json::Value) -> HandlerResult {
    Ok(Json(value))
}

pub async fn health(State(state): State<ApiState>) -> HandlerResult {
    let devices = state.store.all();
    let online = devices.iter().filter(|(_, s)| s.is_online).count();
    ok(json!({
        "status": "ok",
        "devices": devices.len(),
        "online": online,
    }))
}

pub async fn list_devices(State(state): State<ApiState>) -> HandlerResult {
    let devices: Vec<_> = state
        .store
        .all()
        .into_iter()
        .map(|(config, snapshot)| {
            json!({
                "device_id": config.device_id,
                "unit_id": config.unit_id,
                "broker": config.broker,
                "state": snapshot,
            })
        })
        .collect();
    ok(json!({
        "count": devices.len(),
        "devices": devices,
    }))
}

pub async fn get_device(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> HandlerResult {
    let config = state
        .store
        .config(&device_id)
        .map_err(|_| ApiError::not_found("device"))?
        .clone();
    let snapshot = state.store.snapshot(&device_id)?;
    ok(json!({
        "device_id": config.device_id,
        "unit_id": config.unit_id,
        "broker": config.broker,
        "setpoint_range": [config.setpoint_min, config.setpoint_max],
        "state": snapshot,
    }))
}

#[derive(Deserialize)]
pub struct SetpointRequest {
    pub value: f32,
}

pub async fn set_setpoint(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Json(request): Json<SetpointRequest>,
) -> HandlerResult {
    state
        .commands
        .request(
            device_id.clone(),
            Command::SetTemperature(request.value),
            CommandSource::Http,
        )
        .await?;
    ok(json!({ "device_id": device_id, "setpoint": request.value }))
}

#[derive(Deserialize)]
pub struct AutoRequest {
    pub enabled: bool,
}

pub async fn set_auto(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Json(request): Json<AutoRequest>,
) -> HandlerResult {
    let command = if request.enabled {
        Command::EnableAuto
    } else {
        Command::DisableAuto
    };
    state
        .commands
        .request(device_id.clone(), command, CommandSource::Http)
        .await?;
    ok(json!({ "device_id": device_id, "auto_enabled": request.enabled }))
}

#[derive(Deserialize)]
pub struct FanRequest {
    pub value: f32,
}

pub async fn set_fan(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Json(request): Json<FanRequest>,
) -> HandlerResult {
    state
        .commands
        .request(
            device_id.clone(),
            Command::SetFanSpeed(request.value),
            CommandSource::Http,
        )
        .await?;
    ok(json!({ "device_id": device_id, "fan": request.value }))
}

pub async fn emergency_stop(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> HandlerResult {
    state
        .commands
        .request(
            device_id.clone(),
            Command::EmergencyStop,
            CommandSource::Http,
        )
        .await?;
    ok(json!({ "device_id": device_id, "emergency_stop": true }))
}

pub async fn reset_emergency(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> HandlerResult {
    state
        .commands
        .request(
            device_id.clone(),
            Command::ResetEmergency,
            CommandSource::Http,
        )
        .await?;
    ok(json!({ "device_id": device_id, "emergency_stop": false }))
}
