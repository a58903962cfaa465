//! Connection registry — the single source of truth for "is this device
//! online right now".
//!
//! Keyed by `device_id`. Inserting a connection for a device that already has
//! one displaces the old entry: its close signal fires and the stale socket
//! task winds down. Each connection carries a monotonically increasing
//! sequence number so the displaced task's cleanup cannot remove its
//! replacement from the map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::warn;

/// Declared role of a connected device. The hub never infers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Desktop,
    Web,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "desktop" => Some(Role::Desktop),
            "web" => Some(Role::Web),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Desktop => "desktop",
            Role::Web => "web",
        }
    }
}

/// A live, authenticated connection.
pub struct ConnectionHandle {
    pub device_id: String,
    pub device_name: String,
    pub role: Role,
    /// Distinguishes this connection from a later one with the same device id.
    pub seq: u64,
    /// Outbound frames, already serialized. A dedicated task pumps this into
    /// the WebSocket sink so no lock is ever held across a socket write.
    pub tx: mpsc::Sender<String>,
    /// Fired to force-close the owning socket task (displacement, reaper).
    pub close: Arc<Notify>,
    /// Last `ping` from the client, epoch milliseconds.
    pub last_ping_at: u64,
    /// Room this connection is bound to, set at pair-confirm or rejoin.
    pub room_id: Option<String>,
}

/// Registry of live connections, keyed by device id.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
    next_seq: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a connection, displacing any previous one for the same device.
    /// Returns the sequence number assigned to the new connection.
    pub async fn insert(
        &self,
        device_id: &str,
        device_name: &str,
        role: Role,
        tx: mpsc::Sender<String>,
        close: Arc<Notify>,
        now_ms: u64,
    ) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            role,
            seq,
            tx,
            close,
            last_ping_at: now_ms,
            room_id: None,
        };

        let mut conns = self.inner.write().await;
        if let Some(old) = conns.insert(device_id.to_string(), handle) {
            warn!(device_id = %device_id, "Device re-authenticated, closing previous connection");
            // notify_one stores a permit, so the displaced task is closed
            // even if it is mid-dispatch rather than parked on notified().
            old.close.notify_one();
        }
        seq
    }

    /// Remove a connection, but only if it is still the one identified by
    /// `seq`. Returns the removed handle's room binding.
    pub async fn remove_if(&self, device_id: &str, seq: u64) -> Option<Option<String>> {
        let mut conns = self.inner.write().await;
        match conns.get(device_id) {
            Some(c) if c.seq == seq => conns.remove(device_id).map(|c| c.room_id),
            _ => None,
        }
    }

    /// Record a heartbeat for a device.
    pub async fn touch_ping(&self, device_id: &str, now_ms: u64) {
        let mut conns = self.inner.write().await;
        if let Some(c) = conns.get_mut(device_id) {
            c.last_ping_at = now_ms;
        }
    }

    /// Bind a connection to a room. Returns false if the device is offline.
    pub async fn set_room(&self, device_id: &str, room_id: Option<&str>) -> bool {
        let mut conns = self.inner.write().await;
        match conns.get_mut(device_id) {
            Some(c) => {
                c.room_id = room_id.map(ToString::to_string);
                true
            }
            None => false,
        }
    }

    /// Outbound sender for a device, if it is online.
    pub async fn sender(&self, device_id: &str) -> Option<mpsc::Sender<String>> {
        let conns = self.inner.read().await;
        conns.get(device_id).map(|c| c.tx.clone())
    }

    /// Outbound sender for a device, only if its connection is bound to `room_id`.
    pub async fn sender_in_room(&self, device_id: &str, room_id: &str) -> Option<mpsc::Sender<String>> {
        let conns = self.inner.read().await;
        conns
            .get(device_id)
            .filter(|c| c.room_id.as_deref() == Some(room_id))
            .map(|c| c.tx.clone())
    }

    /// Room a device's connection is currently bound to.
    pub async fn room_of(&self, device_id: &str) -> Option<String> {
        let conns = self.inner.read().await;
        conns.get(device_id).and_then(|c| c.room_id.clone())
    }

    /// Whether any live connection is bound to `room_id`.
    pub async fn any_bound_to(&self, room_id: &str) -> bool {
        let conns = self.inner.read().await;
        conns.values().any(|c| c.room_id.as_deref() == Some(room_id))
    }

    /// Close signals of connections whose last ping is older than `max_age_ms`.
    pub async fn stale(&self, now_ms: u64, max_age_ms: u64) -> Vec<(String, Arc<Notify>)> {
        let conns = self.inner.read().await;
        conns
            .values()
            .filter(|c| now_ms.saturating_sub(c.last_ping_at) > max_age_ms)
            .map(|c| (c.device_id.clone(), Arc::clone(&c.close)))
            .collect()
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionRegistry, Role};
    use std::sync::Arc;
    use tokio::sync::{mpsc, Notify};

    async fn register(reg: &ConnectionRegistry, id: &str) -> (u64, Arc<Notify>) {
        let (tx, _rx) = mpsc::channel(4);
        let close = Arc::new(Notify::new());
        let seq = reg
            .insert(id, "Test", Role::Desktop, tx, Arc::clone(&close), 0)
            .await;
        (seq, close)
    }

    #[tokio::test]
    async fn insert_displaces_previous_connection() {
        let reg = ConnectionRegistry::new();
        let (old_seq, old_close) = register(&reg, "D1").await;

        let (new_seq, _) = register(&reg, "D1").await;
        assert_ne!(old_seq, new_seq);

        // The permit is stored even though nobody was awaiting yet.
        tokio::time::timeout(std::time::Duration::from_secs(1), old_close.notified())
            .await
            .expect("displaced connection was not signalled");
        assert_eq!(reg.count().await, 1);
    }

    #[tokio::test]
    async fn stale_cleanup_cannot_remove_replacement() {
        let reg = ConnectionRegistry::new();
        let (old_seq, _) = register(&reg, "D1").await;
        let (new_seq, _) = register(&reg, "D1").await;

        // The displaced task's cleanup runs with the old seq and must not
        // touch the new entry.
        assert!(reg.remove_if("D1", old_seq).await.is_none());
        assert_eq!(reg.count().await, 1);
        assert!(reg.remove_if("D1", new_seq).await.is_some());
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test]
    async fn room_binding_round_trips() {
        let reg = ConnectionRegistry::new();
        register(&reg, "D1").await;
        assert!(reg.set_room("D1", Some("r-1")).await);
        assert_eq!(reg.room_of("D1").await.as_deref(), Some("r-1"));
        assert!(reg.sender_in_room("D1", "r-1").await.is_some());
        assert!(reg.sender_in_room("D1", "r-2").await.is_none());
        assert!(!reg.set_room("D2", Some("r-1")).await);
    }
}
