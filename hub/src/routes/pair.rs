//! Pairing endpoints.
//!
//! | Method | Path                | Description                                  |
//! |--------|---------------------|----------------------------------------------|
//! | POST   | `/api/pair/request` | Issue a pair code for a device               |
//! | POST   | `/api/pair/confirm` | Redeem a code, create the room               |
//! | GET    | `/api/pair/status`  | Whether a device is currently in a room      |
//!
//! All bodies and responses are JSON. Malformed requests (missing fields,
//! unknown platform) are HTTP 400; pairing failures (bad code, expired,
//! same-role) are HTTP 200 with the error carried in the data payload, since
//! they are expected user-facing outcomes rather than protocol violations.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::pairing::display_code;
use crate::registry::Role;
use crate::state::HubState;

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": message})),
    )
}

/// `POST /api/pair/request` — body `{deviceId, deviceName, platform}`.
///
/// Replaces any pending code the device already holds and returns
/// `{success, data: {pairCode, expiresAt}}`. The code is returned in its
/// display form (`ABCD-EFGH`).
pub async fn pair_request(
    State(state): State<HubState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let device_id = body["deviceId"].as_str().unwrap_or("");
    let device_name = body["deviceName"].as_str().unwrap_or("");
    if device_id.is_empty() || device_name.is_empty() {
        return Err(bad_request("deviceId and deviceName are required"));
    }
    let Some(role) = body["platform"].as_str().and_then(Role::parse) else {
        return Err(bad_request("platform must be \"desktop\" or \"web\""));
    };

    let pair = state
        .pairings
        .issue(device_id, device_name, role, crate::util::now_ms())
        .await;
    info!(device_id = %device_id, "Issued pair code");

    Ok(Json(json!({
        "success": true,
        "data": {
            "pairCode": display_code(&pair.code),
            "expiresAt": pair.expires_at,
        }
    })))
}

/// `POST /api/pair/confirm` — body `{pairCode, deviceId, deviceName, platform?}`.
///
/// `platform` defaults to `web`: the cloud flow has the phone redeem the
/// code the desktop displayed. On success both live peers receive a
/// `paired` frame and the response carries the new `pairId`.
pub async fn pair_confirm(
    State(state): State<HubState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pair_code = body["pairCode"].as_str().unwrap_or("");
    let device_id = body["deviceId"].as_str().unwrap_or("");
    let device_name = body["deviceName"].as_str().unwrap_or("");
    if pair_code.is_empty() || device_id.is_empty() || device_name.is_empty() {
        return Err(bad_request("pairCode, deviceId and deviceName are required"));
    }
    let role = match body["platform"].as_str() {
        None => Role::Web,
        Some(p) => match Role::parse(p) {
            Some(r) => r,
            None => return Err(bad_request("platform must be \"desktop\" or \"web\"")),
        },
    };

    match state
        .confirm_pair(pair_code, device_id, device_name, role)
        .await
    {
        Ok(room_id) => Ok(Json(json!({
            "success": true,
            "data": {"success": true, "pairId": room_id}
        }))),
        Err(e) => Ok(Json(json!({
            "success": true,
            "data": {"success": false, "error": e.to_string()}
        }))),
    }
}

/// Query parameters for `GET /api/pair/status`.
#[derive(Deserialize)]
pub struct StatusQuery {
    #[serde(rename = "deviceId")]
    device_id: String,
}

/// `GET /api/pair/status?deviceId=…` — informational, not load-bearing.
pub async fn pair_status(
    State(state): State<HubState>,
    Query(query): Query<StatusQuery>,
) -> Json<Value> {
    match state.rooms.find_for_device(&query.device_id).await {
        Some(room) => Json(json!({
            "success": true,
            "data": {"paired": true, "pairId": room.room_id}
        })),
        None => Json(json!({
            "success": true,
            "data": {"paired": false}
        })),
    }
}
