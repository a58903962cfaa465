//! Shared hub state and the cross-structure operations on it.
//!
//! Three maps make up the hub's entire mutable state: the connection
//! registry, the room table, and the pending-pair store. Each lives behind
//! its own `RwLock`; no operation ever holds two of them at once, and no
//! lock is held across a socket write — outbound frames go through the
//! per-connection channel after all locks are released.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::pairing::{CodeLookup, PairingStore};
use crate::registry::{ConnectionRegistry, Role};
use crate::rooms::RoomTable;
use crate::util::now_ms;

/// Shared application state passed to every handler.
#[derive(Clone)]
pub struct HubState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the hub started (for uptime calculation).
    pub start_time: Instant,
    /// Live authenticated connections, keyed by device id.
    pub registry: ConnectionRegistry,
    /// Desktop↔phone rooms, keyed by room id.
    pub rooms: RoomTable,
    /// Pending pair codes, keyed by normalized code.
    pub pairings: PairingStore,
}

/// Why a pair-confirm was rejected. The `Display` strings go onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairError {
    InvalidCode,
    Expired,
    SameRole,
}

impl std::fmt::Display for PairError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairError::InvalidCode => write!(f, "Invalid pair code"),
            PairError::Expired => write!(f, "Pair code expired"),
            PairError::SameRole => write!(f, "Cannot pair same device types"),
        }
    }
}

/// Counters from one reaper pass, for logging.
#[derive(Debug, Default)]
pub struct SweepStats {
    pub closed_connections: usize,
    pub expired_codes: usize,
    pub evicted_rooms: usize,
}

impl HubState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry: ConnectionRegistry::new(),
            rooms: RoomTable::new(),
            pairings: PairingStore::new(),
        }
    }

    /// Confirm a pair code and create the room.
    ///
    /// The confirmer's role must be opposite the initiator's; on a same-role
    /// clash the code is put back so the user can retry from the correct
    /// device. On success both live peers (if any) are bound to the room and
    /// sent `paired` — the senders are the ones live at insertion time, so a
    /// room never exists without the notification having been attempted.
    pub async fn confirm_pair(
        &self,
        raw_code: &str,
        device_id: &str,
        device_name: &str,
        role: Role,
    ) -> Result<String, PairError> {
        let now = now_ms();

        let initiator = match self.pairings.take(raw_code, now).await {
            CodeLookup::Found(p) => p,
            CodeLookup::Expired => return Err(PairError::Expired),
            CodeLookup::NotFound => return Err(PairError::InvalidCode),
        };

        if initiator.role == role {
            self.pairings.put_back(initiator).await;
            return Err(PairError::SameRole);
        }

        // Slot by role regardless of which side initiated.
        let (desktop_id, web_id) = match role {
            Role::Web => (initiator.device_id.clone(), device_id.to_string()),
            Role::Desktop => (device_id.to_string(), initiator.device_id.clone()),
        };

        let room = self.rooms.create(&desktop_id, &web_id, now).await;
        info!(
            room_id = %room.room_id,
            desktop = %desktop_id,
            web = %web_id,
            "Paired {device_name:?} with {:?}",
            initiator.device_name
        );

        self.registry.set_room(&desktop_id, Some(&room.room_id)).await;
        self.registry.set_room(&web_id, Some(&room.room_id)).await;

        let frame = serde_json::to_string(&json!({
            "type": "paired",
            "pairId": room.room_id,
        }))
        .expect("frame serializes");
        for id in [&desktop_id, &web_id] {
            if let Some(tx) = self.registry.sender(id).await {
                let _ = tx.send(frame.clone()).await;
            }
        }

        Ok(room.room_id)
    }

    /// One reaper pass: close heartbeat-stale connections, expire pending
    /// pair codes, and evict long-idle rooms per the configured policy.
    pub async fn sweep(&self) -> SweepStats {
        let now = now_ms();
        let mut stats = SweepStats::default();

        // Stale connections: no ping for twice the heartbeat interval.
        let max_age_ms = self.config.server.heartbeat_interval_secs * 2 * 1000;
        for (device_id, close) in self.registry.stale(now, max_age_ms).await {
            warn!(device_id = %device_id, "Closing connection (heartbeat timeout)");
            close.notify_one();
            stats.closed_connections += 1;
        }

        stats.expired_codes = self.pairings.remove_expired(now).await;

        // Idle rooms: nobody bound for longer than the configured window.
        let idle_hours = self.config.server.room_max_idle_hours;
        if idle_hours > 0 {
            let cutoff = now.saturating_sub(idle_hours * 3600 * 1000);
            for room in self.rooms.idle_since(cutoff).await {
                if self.registry.any_bound_to(&room.room_id).await {
                    continue;
                }
                self.rooms.remove(&room.room_id).await;
                stats.evicted_rooms += 1;
                info!(room_id = %room.room_id, "Evicted idle room");

                // A member device may be connected without having rejoined —
                // tell it the room is gone so it re-pairs instead of retrying.
                let frame = serde_json::to_string(&json!({
                    "type": "unpaired",
                    "pairId": room.room_id,
                }))
                .expect("frame serializes");
                for id in [&room.desktop_device_id, &room.web_device_id] {
                    if let Some(tx) = self.registry.sender(id).await {
                        let _ = tx.send(frame.clone()).await;
                    }
                }
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::{HubState, PairError};
    use crate::config::Config;
    use crate::registry::Role;

    fn state() -> HubState {
        HubState::new(Config::default())
    }

    #[tokio::test]
    async fn confirm_slots_devices_by_role_not_by_initiator() {
        // Phone initiates, desktop confirms: desktop still lands in the
        // desktop slot.
        let st = state();
        let pair = st.pairings.issue("P1", "Phone", Role::Web, 0).await;
        let room_id = st
            .confirm_pair(&pair.code, "D1", "Desk", Role::Desktop)
            .await
            .unwrap();

        let room = st.rooms.get(&room_id).await.unwrap();
        assert_eq!(room.desktop_device_id, "D1");
        assert_eq!(room.web_device_id, "P1");
    }

    #[tokio::test]
    async fn same_role_confirm_keeps_code_valid() {
        let st = state();
        let pair = st.pairings.issue("D1", "Desk", Role::Desktop, 0).await;

        let err = st
            .confirm_pair(&pair.code, "D2", "Desk2", Role::Desktop)
            .await
            .unwrap_err();
        assert_eq!(err, PairError::SameRole);
        assert_eq!(err.to_string(), "Cannot pair same device types");

        // The phone can still use the same code.
        assert!(st
            .confirm_pair(&pair.code, "P1", "Phone", Role::Web)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn confirm_consumes_the_code() {
        let st = state();
        let pair = st.pairings.issue("D1", "Desk", Role::Desktop, 0).await;
        st.confirm_pair(&pair.code, "P1", "Phone", Role::Web)
            .await
            .unwrap();

        let err = st
            .confirm_pair(&pair.code, "P2", "Phone2", Role::Web)
            .await
            .unwrap_err();
        assert_eq!(err, PairError::InvalidCode);
        assert_eq!(err.to_string(), "Invalid pair code");
    }

    #[tokio::test]
    async fn sweep_expires_codes_but_not_fresh_rooms() {
        let st = state();
        let pair = st.pairings.issue("D1", "Desk", Role::Desktop, 0).await;
        let room_id = st
            .confirm_pair(&pair.code, "P1", "Phone", Role::Web)
            .await
            .unwrap();

        let stats = st.sweep().await;
        assert_eq!(stats.evicted_rooms, 0);
        assert!(st.rooms.get(&room_id).await.is_some());
    }
}
