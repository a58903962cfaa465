//! Hub-link connection statistics.
//!
//! Atomics for lock-free hot-path updates (every relayed frame touches a
//! counter), a Mutex only for the cold-path event log. The event ring keeps
//! the last [`MAX_LINK_EVENTS`] lifecycle transitions so "why did the phone
//! go quiet last night" is answerable from a running agent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

/// Link lifecycle event types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEventType {
    Connected,
    Disconnected,
    AuthFailed,
    ReconnectAttempt,
    PairCodeIssued,
}

impl LinkEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::AuthFailed => "auth_failed",
            Self::ReconnectAttempt => "reconnect_attempt",
            Self::PairCodeIssued => "pair_code_issued",
        }
    }
}

/// A link lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct LinkEvent {
    pub timestamp: Instant,
    pub event_type: LinkEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_LINK_EVENTS: usize = 50;

/// Counters and event history for the agent's hub connection.
pub struct LinkStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    /// Epoch-ms timestamp of the last `pong` from the hub.
    pub last_pong_at: AtomicU64,
    events: Mutex<VecDeque<LinkEvent>>,
}

impl LinkStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            last_pong_at: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(MAX_LINK_EVENTS)),
        }
    }

    /// Push a lifecycle event, evicting the oldest at capacity.
    pub async fn push_event(&self, event_type: LinkEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_LINK_EVENTS {
            events.pop_front();
        }
        events.push_back(LinkEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }

    /// Recent lifecycle events, oldest first.
    pub async fn recent_events(&self) -> Vec<LinkEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "connected={} reconnects={} sent={} received={}",
            self.connected.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.frames_sent.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
        )
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{LinkEventType, LinkStats, MAX_LINK_EVENTS};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn event_ring_evicts_oldest_at_capacity() {
        let stats = LinkStats::new();
        for i in 0..(MAX_LINK_EVENTS + 10) {
            stats
                .push_event(LinkEventType::ReconnectAttempt, format!("attempt {i}"))
                .await;
        }
        let events = stats.recent_events().await;
        assert_eq!(events.len(), MAX_LINK_EVENTS);
        assert_eq!(events[0].detail, "attempt 10");
        assert_eq!(events.last().unwrap().detail, format!("attempt {}", MAX_LINK_EVENTS + 9));
    }

    #[tokio::test]
    async fn summary_reflects_counters() {
        let stats = LinkStats::new();
        stats.connected.store(true, Ordering::Relaxed);
        stats.frames_sent.fetch_add(3, Ordering::Relaxed);
        stats.frames_received.fetch_add(7, Ordering::Relaxed);

        let summary = stats.summary();
        assert!(summary.contains("connected=true"), "{summary}");
        assert!(summary.contains("sent=3"), "{summary}");
        assert!(summary.contains("received=7"), "{summary}");
    }
}
