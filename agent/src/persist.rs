//! On-disk agent state for reconnecting without re-pairing.
//!
//! A single JSON file under the data dir holds the device id (stable across
//! restarts so the hub's single-connection-per-device rule applies to us,
//! not a stranger) and the last known room id for `rejoin`. Everything here
//! is best-effort: a missing or corrupt file just means a fresh pairing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Persisted agent identity and pairing state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub device_id: Option<String>,
    pub room_id: Option<String>,
}

fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state.json")
}

/// Load persisted state, falling back to defaults on any error.
pub fn load(data_dir: &Path) -> AgentState {
    let path = state_path(data_dir);
    match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring corrupt state file {}: {e}", path.display());
            AgentState::default()
        }),
        Err(_) => AgentState::default(),
    }
}

/// Write state to disk. Failures are logged, never fatal.
pub fn save(data_dir: &Path, state: &AgentState) {
    if let Err(e) = std::fs::create_dir_all(data_dir) {
        warn!("Cannot create data dir {}: {e}", data_dir.display());
        return;
    }
    let path = state_path(data_dir);
    match serde_json::to_string_pretty(state) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                warn!("Cannot write state file {}: {e}", path.display());
            }
        }
        Err(e) => warn!("Cannot serialize agent state: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{load, save, AgentState};

    #[test]
    fn state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let state = AgentState {
            device_id: Some("D1".to_string()),
            room_id: Some("r-1".to_string()),
        };
        save(dir.path(), &state);

        let loaded = load(dir.path());
        assert_eq!(loaded.device_id.as_deref(), Some("D1"));
        assert_eq!(loaded.room_id.as_deref(), Some("r-1"));
    }

    #[test]
    fn corrupt_or_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(dir.path());
        assert!(loaded.device_id.is_none());

        std::fs::write(dir.path().join("state.json"), "{not json").unwrap();
        let loaded = load(dir.path());
        assert!(loaded.device_id.is_none());
    }
}
