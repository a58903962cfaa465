//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TETHER_HUB_LISTEN`, `PORT`
//! 2. **Config file** — path via `--config <path>`, or `tether-hub.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3000"
//! static_dir = "./public"
//! heartbeat_interval_secs = 30
//! room_max_idle_hours = 24    # 0 = rooms are never evicted
//!
//! [logging]
//! level = "info"
//!
//! [supervisor]
//! max_backoff = 60
//! probe_interval_secs = 5
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory of phone-UI static assets served under `/` and `/mobile`.
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
    /// Expected interval between client `ping` frames. A connection is closed
    /// after twice this interval without one.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Evict rooms idle (no bound connection, no traffic) longer than this
    /// many hours. 0 disables eviction entirely.
    #[serde(default = "default_room_max_idle_hours")]
    pub room_max_idle_hours: u64,
}

/// Supervisor settings for `tether-hub supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds between TCP liveness probes of the listen address; backoff
    /// resets once a probe connects (default 5).
    #[serde(default = "default_supervisor_probe_interval")]
    pub probe_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_static_dir() -> String {
    "./public".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_room_max_idle_hours() -> u64 {
    24
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_probe_interval() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            static_dir: default_static_dir(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            room_max_idle_hours: default_room_max_idle_hours(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            probe_interval_secs: default_supervisor_probe_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `tether-hub.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("tether-hub.toml").exists() {
            let content =
                std::fs::read_to_string("tether-hub.toml").expect("Failed to read tether-hub.toml");
            toml::from_str(&content).expect("Failed to parse tether-hub.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("TETHER_HUB_LISTEN") {
            config.server.listen = listen;
        } else if let Ok(port) = std::env::var("PORT") {
            config.server.listen = format!("0.0.0.0:{port}");
        }

        config
    }
}
