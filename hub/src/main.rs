#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tether-hub
//!
//! Cloud rendezvous hub for tether. The hub matches a phone and a desktop
//! agent into a private room via a short pair code, then relays JSON frames
//! between the two for as long as either cares to stay connected. It never
//! stores or interprets assistant content.
//!
//! ## Subcommands
//!
//! - `tether-hub serve` (default) — run the HTTP/WS hub
//! - `tether-hub supervise` — run as supervisor: starts the hub and restarts on crash
//!
//! ## API surface
//!
//! | Method | Path                | Description                         |
//! |--------|---------------------|-------------------------------------|
//! | GET    | `/health`           | Liveness probe                      |
//! | POST   | `/api/pair/request` | Issue a pair code                   |
//! | POST   | `/api/pair/confirm` | Redeem a code, create the room      |
//! | GET    | `/api/pair/status`  | Pairing status for a device         |
//! | GET    | `/ws`               | WebSocket for desktop/phone peers   |
//! | GET    | `/`, `/mobile`      | Phone web UI static assets          |
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, clap subcommands, reaper task, graceful shutdown
//! supervisor.rs — built-in supervisor (fork/restart loop)
//! config.rs     — TOML + env-var configuration
//! state.rs      — shared state, pair-confirm flow, reaper sweep
//! pairing.rs    — pair-code alphabet, pending store, normalization
//! registry.rs   — device → live connection map, single-active-per-device
//! rooms.rs      — room table, survives peer disconnects
//! ws.rs         — per-connection dispatcher: auth, ping, rejoin, relay
//! routes/
//!   health.rs   — GET /health
//!   pair.rs     — pair request/confirm/status
//! ```

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use tether_hub::{router, Config, HubState};

/// Rendezvous hub that pairs phones with desktop agents.
#[derive(Parser)]
#[command(name = "tether-hub", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS hub (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts the hub and restarts on crash.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise { config }) => {
            run_supervisor_mode(config.as_deref()).await;
        }
        Some(Commands::Serve { config }) => {
            run_hub(config.as_deref()).await;
        }
        None => {
            run_hub(None).await;
        }
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ! {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("tether-hub supervisor starting");
    tether_hub::supervisor::run_supervisor(config_path, &config).await
}

async fn run_hub(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("tether-hub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.server.room_max_idle_hours == 0 {
        info!("Room eviction disabled (room_max_idle_hours = 0)");
    }

    let state = HubState::new(config);
    let app = router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Hub ready");

    // Periodic reaper: stale connections, expired codes, idle rooms.
    let sweep_state = state.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let stats = sweep_state.sweep().await;
            if stats.closed_connections + stats.expired_codes + stats.evicted_rooms > 0 {
                info!(
                    "Reaper: {} connection(s) closed, {} code(s) expired, {} room(s) evicted",
                    stats.closed_connections, stats.expired_codes, stats.evicted_rooms
                );
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Hub error");

    info!("Shutting down...");
    sweep_task.abort();
    info!("Goodbye");
}
