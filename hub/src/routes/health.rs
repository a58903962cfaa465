//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::HubState;

/// `GET /health` — liveness probe.
///
/// Returns `{"status":"ok","uptime_secs":N,"version":"..."}` plus live
/// counters, suitable for load-balancer health checks.
pub async fn health(State(state): State<HubState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.count().await,
        "rooms": state.rooms.count().await,
    }))
}
