//! Room table — durable two-device bindings.
//!
//! A room pairs exactly one desktop-role device with one web-role device and
//! is identified by a UUIDv4. Rooms survive either peer disconnecting: the
//! close path removes only the [`crate::registry::ConnectionRegistry`] entry,
//! never the room. A reconnecting peer reattaches with `rejoin`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// A desktop↔phone binding.
#[derive(Debug, Clone)]
pub struct Room {
    pub room_id: String,
    pub desktop_device_id: String,
    pub web_device_id: String,
    pub created_at: u64,
    /// Refreshed by relay traffic and rejoin; drives idle eviction.
    pub last_active_at: u64,
}

impl Room {
    /// Whether `device_id` is one of the room's two devices.
    #[must_use]
    pub fn contains(&self, device_id: &str) -> bool {
        self.desktop_device_id == device_id || self.web_device_id == device_id
    }

    /// The other device of the room, or `None` if `device_id` is not a member.
    #[must_use]
    pub fn peer_of(&self, device_id: &str) -> Option<&str> {
        if self.desktop_device_id == device_id {
            Some(&self.web_device_id)
        } else if self.web_device_id == device_id {
            Some(&self.desktop_device_id)
        } else {
            None
        }
    }
}

/// Table of all rooms, keyed by room id.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct RoomTable {
    inner: Arc<RwLock<HashMap<String, Room>>>,
}

impl RoomTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a room. Any existing room containing either device is removed
    /// first, so a device is a member of at most one room.
    pub async fn create(&self, desktop_device_id: &str, web_device_id: &str, now_ms: u64) -> Room {
        let room = Room {
            room_id: uuid::Uuid::new_v4().to_string(),
            desktop_device_id: desktop_device_id.to_string(),
            web_device_id: web_device_id.to_string(),
            created_at: now_ms,
            last_active_at: now_ms,
        };
        let mut rooms = self.inner.write().await;
        rooms.retain(|_, r| !r.contains(desktop_device_id) && !r.contains(web_device_id));
        rooms.insert(room.room_id.clone(), room.clone());
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Room> {
        self.inner.read().await.get(room_id).cloned()
    }

    /// The room a device belongs to, if any.
    pub async fn find_for_device(&self, device_id: &str) -> Option<Room> {
        let rooms = self.inner.read().await;
        rooms.values().find(|r| r.contains(device_id)).cloned()
    }

    /// Refresh a room's activity clock.
    pub async fn touch(&self, room_id: &str, now_ms: u64) {
        let mut rooms = self.inner.write().await;
        if let Some(r) = rooms.get_mut(room_id) {
            r.last_active_at = now_ms;
        }
    }

    pub async fn remove(&self, room_id: &str) -> Option<Room> {
        self.inner.write().await.remove(room_id)
    }

    /// Rooms idle since before `cutoff_ms`. Candidates for eviction; the
    /// caller decides based on connection state.
    pub async fn idle_since(&self, cutoff_ms: u64) -> Vec<Room> {
        let rooms = self.inner.read().await;
        rooms
            .values()
            .filter(|r| r.last_active_at < cutoff_ms)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for RoomTable {
    fn default() -> Self {
        Self::new()
    }
}
