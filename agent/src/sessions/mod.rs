//! Session lifecycle management.
//!
//! [`SessionMux`] is the single authority for creating, switching, closing,
//! renaming, and feeding sessions. Each session wraps one
//! [`worker::SessionWorker`] anchored to an allow-listed directory; ids are
//! small integers handed out monotonically and never reused. One session is
//! "active" at a time — bare operator text goes there — while phone traffic
//! addresses sessions explicitly by the envelope's `sessionId`.
//!
//! All user-visible output is re-emitted as [`MuxEvent`]s on a broadcast
//! channel; the multiplexer never formats.
//!
//! ## Concurrency
//!
//! The session map is behind an `RwLock`. `create` holds the write lock
//! across the limit-check and insert to prevent TOCTOU races. The busy lock
//! itself lives in the worker; `send` re-checks it there.

pub mod worker;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::info;

use crate::scope::DirScope;
use crate::util::now_ms;
use worker::{MessageKind, SessionWorker, UsageStats, WorkerConfig, WorkerEvent};

/// Session lifecycle status as reported by `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Busy,
    Stopped,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Busy => "busy",
            SessionStatus::Stopped => "stopped",
        }
    }
}

/// Events the multiplexer re-emits to its subscribers (hub link, bridge).
#[derive(Debug, Clone)]
pub enum MuxEvent {
    SessionCreated { id: u64, name: String },
    SessionSwitched { id: u64, name: String },
    SessionClosed { id: u64, name: String },
    SessionRenamed { id: u64, name: String },
    SessionReady { id: u64 },
    SessionMessage { id: u64, kind: MessageKind, text: String },
    SessionDone { id: u64 },
    SessionError { id: u64, error: String },
    SessionExited { id: u64, code: i32 },
}

/// One row of `list` output.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub name: String,
    pub working_directory: String,
    pub status: SessionStatus,
    pub is_active: bool,
    pub message_count: u64,
    pub running_minutes: u64,
}

struct SessionEntry {
    id: u64,
    name: String,
    working_dir: PathBuf,
    created_at: u64,
    last_active_at: u64,
    worker: SessionWorker,
}

impl SessionEntry {
    fn status(&self) -> SessionStatus {
        if !self.worker.is_running() {
            SessionStatus::Stopped
        } else if self.worker.is_busy() {
            SessionStatus::Busy
        } else {
            SessionStatus::Idle
        }
    }
}

struct MuxInner {
    sessions: BTreeMap<u64, SessionEntry>,
    active: Option<u64>,
    next_id: u64,
}

/// Manages the pool of assistant sessions.
///
/// Cloneable — all clones share the same inner state.
#[derive(Clone)]
pub struct SessionMux {
    inner: Arc<RwLock<MuxInner>>,
    events: broadcast::Sender<MuxEvent>,
    worker_tx: mpsc::UnboundedSender<(u64, WorkerEvent)>,
    scope: Arc<DirScope>,
    worker_config: WorkerConfig,
    max_sessions: usize,
}

impl SessionMux {
    /// Build a multiplexer and start its worker-event pump.
    #[must_use]
    pub fn new(scope: DirScope, worker_config: WorkerConfig, max_sessions: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let mux = Self {
            inner: Arc::new(RwLock::new(MuxInner {
                sessions: BTreeMap::new(),
                active: None,
                next_id: 1,
            })),
            events,
            worker_tx,
            scope: Arc::new(scope),
            worker_config,
            max_sessions,
        };
        mux.spawn_event_pump(worker_rx);
        mux
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MuxEvent> {
        self.events.subscribe()
    }

    /// Translate raw worker events into [`MuxEvent`]s.
    fn spawn_event_pump(&self, mut worker_rx: mpsc::UnboundedReceiver<(u64, WorkerEvent)>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some((id, event)) = worker_rx.recv().await {
                let out = match event {
                    WorkerEvent::Ready => MuxEvent::SessionReady { id },
                    WorkerEvent::Message { kind, text } => {
                        MuxEvent::SessionMessage { id, kind, text }
                    }
                    WorkerEvent::Done => MuxEvent::SessionDone { id },
                    WorkerEvent::Error { message } => MuxEvent::SessionError { id, error: message },
                    WorkerEvent::Exit { code } => MuxEvent::SessionExited { id, code },
                };
                let _ = events.send(out);
            }
        });
    }

    /// Create a session anchored to `dir` (or the first allow-list root) and
    /// start its worker. Fails on cap, scope, or a missing directory.
    pub async fn create(&self, name: Option<&str>, dir: Option<&str>) -> Result<SessionInfo, String> {
        let mut inner = self.inner.write().await;

        if inner.sessions.len() >= self.max_sessions {
            return Err(format!("Session limit reached (max {})", self.max_sessions));
        }

        let default_dir;
        let dir = match dir {
            Some(d) => d,
            None => {
                default_dir = self
                    .scope
                    .default_dir()
                    .ok_or("No working directory given and no allowed_dirs configured")?
                    .to_string_lossy()
                    .into_owned();
                &default_dir
            }
        };
        let canon = self.scope.check(dir)?;

        let id = inner.next_id;
        inner.next_id += 1;
        let name = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => canon
                .file_name()
                .map_or_else(|| format!("session-{id}"), |n| n.to_string_lossy().into_owned()),
        };

        let worker = SessionWorker::new(
            id,
            canon.clone(),
            self.worker_config.clone(),
            self.worker_tx.clone(),
        );
        worker.start().await?;

        let now = now_ms();
        let entry = SessionEntry {
            id,
            name: name.clone(),
            working_dir: canon,
            created_at: now,
            last_active_at: now,
            worker,
        };
        let first = inner.sessions.is_empty();
        let info = entry_info(&entry, first, 0);
        inner.sessions.insert(id, entry);
        if inner.active.is_none() {
            inner.active = Some(id);
        }
        info!(session = id, name = %name, "Session created, total: {}", inner.sessions.len());
        drop(inner);

        let _ = self.events.send(MuxEvent::SessionCreated { id, name });
        Ok(info)
    }

    /// Switch the active session, resolving numeric id first, then exact name.
    pub async fn switch(&self, id_or_name: &str) -> Result<(u64, String), String> {
        let mut inner = self.inner.write().await;
        let id = resolve(&inner, id_or_name)?;
        inner.active = Some(id);
        let entry = inner.sessions.get_mut(&id).expect("resolved id exists");
        entry.last_active_at = now_ms();
        let name = entry.name.clone();
        drop(inner);

        let _ = self.events.send(MuxEvent::SessionSwitched { id, name: name.clone() });
        Ok((id, name))
    }

    /// Close a session (default: the active one) and stop its worker. When
    /// the active session closes, the oldest remaining becomes active.
    pub async fn close(&self, id: Option<u64>) -> Result<(u64, String), String> {
        let mut inner = self.inner.write().await;
        let id = match id {
            Some(id) => id,
            None => inner.active.ok_or("No active session")?,
        };
        let entry = inner
            .sessions
            .remove(&id)
            .ok_or_else(|| format!("Session not found: {id}"))?;
        if inner.active == Some(id) {
            inner.active = inner.sessions.keys().next().copied();
        }
        let remaining = inner.sessions.len();
        drop(inner);

        // The graceful stop can take seconds; never under the lock.
        entry.worker.stop().await;
        info!(session = id, "Session closed, remaining: {remaining}");

        let _ = self.events.send(MuxEvent::SessionClosed {
            id,
            name: entry.name.clone(),
        });
        Ok((id, entry.name))
    }

    /// Rename the active session.
    pub async fn rename(&self, name: &str) -> Result<(u64, String), String> {
        if name.is_empty() {
            return Err("Name must not be empty".to_string());
        }
        let mut inner = self.inner.write().await;
        let id = inner.active.ok_or("No active session")?;
        let entry = inner.sessions.get_mut(&id).expect("active id exists");
        entry.name = name.to_string();
        drop(inner);

        let _ = self.events.send(MuxEvent::SessionRenamed {
            id,
            name: name.to_string(),
        });
        Ok((id, name.to_string()))
    }

    /// All sessions in id order.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().await;
        let mut items = Vec::with_capacity(inner.sessions.len());
        for entry in inner.sessions.values() {
            let message_count = entry.worker.usage().await.message_count;
            items.push(entry_info(
                entry,
                inner.active == Some(entry.id),
                message_count,
            ));
        }
        items
    }

    /// Send text to the active session.
    pub async fn send_active(&self, text: &str) -> Result<u64, String> {
        let (id, worker) = {
            let inner = self.inner.read().await;
            let id = inner.active.ok_or("No active session")?;
            let entry = inner.sessions.get(&id).expect("active id exists");
            (id, entry.worker.clone())
        };
        self.send_via(id, &worker, text).await
    }

    /// Send text to a session addressed by id or name (the envelope routing
    /// path — phone traffic never depends on which session is active).
    pub async fn send_to(&self, id_or_name: &str, text: &str) -> Result<u64, String> {
        let (id, worker) = {
            let inner = self.inner.read().await;
            let id = resolve(&inner, id_or_name)?;
            let entry = inner.sessions.get(&id).expect("resolved id exists");
            (id, entry.worker.clone())
        };
        self.send_via(id, &worker, text).await
    }

    async fn send_via(&self, id: u64, worker: &SessionWorker, text: &str) -> Result<u64, String> {
        if !worker.is_running() {
            return Err("Session worker is not running".to_string());
        }
        if worker.is_busy() {
            return Err("Session is busy".to_string());
        }
        worker.send(text).await?;

        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.get_mut(&id) {
            entry.last_active_at = now_ms();
        }
        Ok(id)
    }

    /// Active session id and name, if any.
    pub async fn active(&self) -> Option<(u64, String)> {
        let inner = self.inner.read().await;
        let id = inner.active?;
        inner.sessions.get(&id).map(|e| (id, e.name.clone()))
    }

    /// Display name of a session.
    pub async fn name_of(&self, id: u64) -> Option<String> {
        let inner = self.inner.read().await;
        inner.sessions.get(&id).map(|e| e.name.clone())
    }

    /// Usage counters of the active session's worker.
    pub async fn active_usage(&self) -> Result<(String, UsageStats), String> {
        let (name, worker) = {
            let inner = self.inner.read().await;
            let id = inner.active.ok_or("No active session")?;
            let entry = inner.sessions.get(&id).expect("active id exists");
            (entry.name.clone(), entry.worker.clone())
        };
        Ok((name, worker.usage().await))
    }

    /// Force-stop the active session's worker. Returns its id.
    pub async fn force_stop_active(&self) -> Result<u64, String> {
        let (id, worker) = self.active_worker().await?;
        worker.force_stop().await;
        Ok(id)
    }

    /// Restart the active session's worker (resets usage). Returns its id.
    pub async fn restart_active(&self) -> Result<u64, String> {
        let (id, worker) = self.active_worker().await?;
        worker.restart().await?;
        Ok(id)
    }

    async fn active_worker(&self) -> Result<(u64, SessionWorker), String> {
        let inner = self.inner.read().await;
        let id = inner.active.ok_or("No active session")?;
        let entry = inner.sessions.get(&id).expect("active id exists");
        Ok((id, entry.worker.clone()))
    }

    /// Stop every worker. Used during shutdown.
    pub async fn close_all(&self) {
        let workers: Vec<SessionWorker> = {
            let mut inner = self.inner.write().await;
            inner.active = None;
            inner.sessions.values().map(|e| e.worker.clone()).collect()
        };
        for worker in &workers {
            worker.stop().await;
        }
        self.inner.write().await.sessions.clear();
        if !workers.is_empty() {
            info!("Shut down {} session(s)", workers.len());
        }
    }
}

fn entry_info(entry: &SessionEntry, is_active: bool, message_count: u64) -> SessionInfo {
    SessionInfo {
        id: entry.id,
        name: entry.name.clone(),
        working_directory: entry.working_dir.to_string_lossy().into_owned(),
        status: entry.status(),
        is_active,
        message_count,
        running_minutes: now_ms().saturating_sub(entry.created_at) / 60_000,
    }
}

/// Numeric id first, then exact name.
fn resolve(inner: &MuxInner, id_or_name: &str) -> Result<u64, String> {
    if let Ok(id) = id_or_name.parse::<u64>() {
        if inner.sessions.contains_key(&id) {
            return Ok(id);
        }
    }
    inner
        .sessions
        .values()
        .find(|e| e.name == id_or_name)
        .map(|e| e.id)
        .ok_or_else(|| format!("Session not found: {id_or_name}"))
}
