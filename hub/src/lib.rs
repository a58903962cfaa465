#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! tether-hub library — exposes the hub's building blocks so the loopback
//! integration tests (and any embedding binary) can assemble a hub in-process.
//!
//! - `pairing` — pair-code issuance, normalization, pending store
//! - `registry` — live-connection registry, one entry per device
//! - `rooms` — desktop↔phone room table
//! - `state` — shared state, pair-confirm flow, reaper sweep
//! - `ws` — WebSocket dispatcher (auth, ping, rejoin, relay)
//! - `routes` — pairing + health HTTP handlers
//! - `config` — TOML + env configuration

pub mod config;
pub mod pairing;
pub mod registry;
pub mod rooms;
pub mod routes;
pub mod state;
pub mod supervisor;
pub mod util;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use registry::{ConnectionRegistry, Role};
pub use rooms::RoomTable;
pub use state::HubState;

/// Assemble the full hub router: pairing API, WebSocket endpoint, health
/// probe, and the phone-UI static asset tree under `/` and `/mobile`.
pub fn router(state: HubState) -> Router {
    let static_dir = state.config.server.static_dir.clone();
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/pair/request", post(routes::pair::pair_request))
        .route("/api/pair/confirm", post(routes::pair::pair_confirm))
        .route("/api/pair/status", get(routes::pair::pair_status))
        .route("/ws", get(ws::ws_upgrade))
        .nest_service("/mobile", ServeDir::new(&static_dir))
        .fallback_service(ServeDir::new(&static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
