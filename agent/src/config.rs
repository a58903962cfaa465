//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TETHER_HUB_URL`, `TETHER_DEVICE_NAME`,
//!    `TETHER_BRIDGE_PASSWORD`
//! 2. **Config file** — path via `--config <path>`, or `tether-agent.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [hub]
//! url = "wss://hub.example.com/ws"
//! http_url = "https://hub.example.com"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! heartbeat_interval_secs = 30
//!
//! [device]
//! name = "Desktop"
//!
//! [agent]
//! data_dir = "~/.local/share/tether"
//! cli_path = "~/.local/bin/claude"
//! max_sessions = 10
//! allowed_dirs = ["~/projects"]
//! allowed_tools = []       # empty = --dangerously-skip-permissions
//! restart_delay_secs = 3
//!
//! [bridge]
//! password = ""            # empty = no auth gate on the console
//! chunk_limit = 4000
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hub connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// WebSocket endpoint of the hub (default local dev hub).
    #[serde(default = "default_hub_url")]
    pub url: String,
    /// HTTP base of the hub, for pair-code requests.
    #[serde(default = "default_hub_http_url")]
    pub http_url: String,
    /// Seconds between reconnect attempts, initial backoff (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max seconds between reconnect attempts (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between heartbeat pings (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Device identity presented to the hub.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Display name shown on the phone. Override with `TETHER_DEVICE_NAME`.
    #[serde(default = "default_device_name")]
    pub name: String,
}

/// Session and CLI settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Directory for persistent data (device id, room id).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Assistant CLI binary (default `~/.local/bin/claude`).
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    /// Maximum concurrent sessions (default 10).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Directories sessions may anchor to. Empty list refuses all creates.
    #[serde(default = "default_allowed_dirs")]
    pub allowed_dirs: Vec<String>,
    /// Tools the CLI may use without asking. Empty allows all
    /// (`--dangerously-skip-permissions`).
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Seconds before a crashed CLI child is respawned (default 3).
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
}

/// Chat-front-end bridge settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Shared secret for the operator auth gate. Empty disables the gate.
    /// Override with `TETHER_BRIDGE_PASSWORD`.
    #[serde(default)]
    pub password: String,
    /// Outbound message size cap; oversized text is chunked (default 4000).
    #[serde(default = "default_chunk_limit")]
    pub chunk_limit: usize,
    /// Whether the front-end renders inline HTML. When set, interpolated
    /// content is escaped before sending.
    #[serde(default)]
    pub html_markup: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:3000/ws".to_string()
}
fn default_hub_http_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_device_name() -> String {
    "Desktop".to_string()
}
fn default_data_dir() -> String {
    "~/.local/share/tether".to_string()
}
fn default_cli_path() -> String {
    "~/.local/bin/claude".to_string()
}
fn default_max_sessions() -> usize {
    10
}
fn default_allowed_dirs() -> Vec<String> {
    vec!["~".to_string()]
}
fn default_restart_delay() -> u64 {
    3
}
fn default_chunk_limit() -> usize {
    4000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_hub_url(),
            http_url: default_hub_http_url(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cli_path: default_cli_path(),
            max_sessions: default_max_sessions(),
            allowed_dirs: default_allowed_dirs(),
            allowed_tools: Vec::new(),
            restart_delay_secs: default_restart_delay(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            chunk_limit: default_chunk_limit(),
            html_markup: false,
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
            hub: HubConfig::default(),
            device: DeviceConfig::default(),
            agent: AgentConfig::default(),
            bridge: BridgeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `tether-agent.toml` in the current directory, falling back
    /// to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("tether-agent.toml").exists() {
            let content = std::fs::read_to_string("tether-agent.toml")
                .expect("Failed to read tether-agent.toml");
            toml::from_str(&content).expect("Failed to parse tether-agent.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(url) = std::env::var("TETHER_HUB_URL") {
            config.hub.url = url;
        }
        if let Ok(name) = std::env::var("TETHER_DEVICE_NAME") {
            config.device.name = name;
        }
        if let Ok(password) = std::env::var("TETHER_BRIDGE_PASSWORD") {
            config.bridge.password = password;
        }

        config
    }
}
