#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! tether-agent library — exposes the agent's building blocks for the
//! fake-CLI integration tests and any embedding binary.
//!
//! - `sessions` — session multiplexer and the per-session CLI worker
//! - `bridge` — single-operator chat-front-end glue (auth gate, queue)
//! - `hub_link` — outbound WS connection to the hub
//! - `scope` — directory allow-list guard
//! - `codec` — chunking and HTML escaping for size-limited channels
//! - `persist` — device id + room id state file
//! - `config` — TOML + env configuration

pub mod bridge;
pub mod codec;
pub mod config;
pub mod hub_link;
pub mod persist;
pub mod scope;
pub mod sessions;
pub mod stats;
pub mod util;

pub use bridge::Bridge;
pub use config::Config;
pub use scope::DirScope;
pub use sessions::SessionMux;
