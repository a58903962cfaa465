#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tether-agent
//!
//! Desktop agent for tether. Owns one or more assistant-CLI sessions, each
//! anchored to an allow-listed directory, and exposes them either through a
//! tether hub (phone drives the sessions) or through a local operator
//! console (the chat-front-end bridge variant).
//!
//! ## Subcommands
//!
//! - `tether-agent serve` (default) — connect to the hub and serve the phone
//! - `tether-agent console` — run the single-operator bridge on stdin/stdout
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! hub_link.rs      — outbound WS to the hub, reconnect, rejoin, frame routing
//! persist.rs       — device id + room id state file for rejoin
//! scope.rs         — directory allow-list guard
//! codec.rs         — chunking for size-limited channels, HTML escaping
//! sessions/
//!   mod.rs         — SessionMux (create/switch/close/rename/list/send)
//!   worker.rs      — persistent CLI child, stream-json protocol, busy lock
//! bridge/
//!   mod.rs         — operator auth gate, busy queue, output tagging
//!   commands.rs    — /new /switch /list /close /rename /session /status ...
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tether_agent::sessions::worker::WorkerConfig;
use tether_agent::stats::LinkStats;
use tether_agent::util::expand_tilde;
use tether_agent::{hub_link, persist, Bridge, Config, DirScope, SessionMux};

/// Desktop agent that tunnels assistant CLI sessions through a tether hub.
#[derive(Parser)]
#[command(name = "tether-agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the hub and serve the paired phone (default).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the single-operator bridge on stdin/stdout.
    Console {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Console { config }) => run_console(config.as_deref()).await,
        Some(Commands::Serve { config }) => run_serve(config.as_deref()).await,
        None => run_serve(None).await,
    }
}

fn build_mux(config: &Config) -> SessionMux {
    let scope = DirScope::new(&config.agent.allowed_dirs);
    if scope.is_empty() {
        warn!("No usable allowed_dirs configured — session creation will fail");
    }
    let worker_config = WorkerConfig {
        cli_path: config.agent.cli_path.clone(),
        restart_delay: Duration::from_secs(config.agent.restart_delay_secs),
        allowed_tools: config.agent.allowed_tools.clone(),
    };
    SessionMux::new(scope, worker_config, config.agent.max_sessions)
}

fn data_dir(config: &Config) -> PathBuf {
    PathBuf::from(expand_tilde(&config.agent.data_dir).into_owned())
}

/// Stable device id: persisted on first run so the hub's one-connection-per-
/// device rule keeps applying to this machine.
fn ensure_device_id(dir: &std::path::Path) -> String {
    let mut state = persist::load(dir);
    match state.device_id.clone() {
        Some(id) => id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            state.device_id = Some(id.clone());
            persist::save(dir, &state);
            id
        }
    }
}

async fn run_serve(config_path: Option<&str>) {
    let config = Config::load(config_path);
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tether-agent v{} starting", env!("CARGO_PKG_VERSION"));

    let dir = data_dir(&config);
    let device_id = ensure_device_id(&dir);
    info!(device_id = %device_id, "Device identity loaded");

    let mux = build_mux(&config);
    let config = Arc::new(config);
    let stats = Arc::new(LinkStats::new());
    let link_task = hub_link::spawn(
        Arc::clone(&config),
        mux.clone(),
        device_id,
        dir,
        Arc::clone(&stats),
    );

    shutdown_signal().await;
    info!("Shutting down...");
    link_task.abort();
    mux.close_all().await;
    info!("Hub link: {}", stats.summary());
    info!("Goodbye");
}

async fn run_console(config_path: Option<&str>) {
    let config = Config::load(config_path);
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    // Logs go to stderr: stdout belongs to the operator conversation.
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("tether-agent console starting");
    let mux = build_mux(&config);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let bridge = Bridge::new(mux.clone(), &config.bridge, out_tx);

    let print_task = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            println!("{chunk}");
        }
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    println!("tether console — /start for help");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => bridge.handle_operator_line("console", &line).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin error: {e}");
                        break;
                    }
                }
            }
            () = shutdown_signal() => break,
        }
    }

    info!("Shutting down...");
    mux.close_all().await;
    print_task.abort();
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
}
