//! Assistant-CLI worker: one persistent child process per session.
//!
//! The worker spawns the CLI once with line-delimited structured I/O on both
//! ends (`--input-format stream-json --output-format stream-json`) and keeps
//! it alive across turns — the CLI holds the conversation, the worker holds
//! the pipe. Each stdout line is one JSON message with a `type` field:
//!
//! - `system`/`init` — provider session id and model name
//! - `assistant` — incremental text blocks, accumulated into the in-progress
//!   response
//! - `result` — end of turn: timing, cost, token usage; flushes the
//!   accumulated response and releases the busy lock
//!
//! A user message is a single stdin line:
//! `{"type":"user","message":{"role":"user","content":…}}`.
//!
//! ## Ownership
//!
//! One task owns the child for its whole life: it spawns, reads stdout to
//! EOF, reaps, and (unless the worker was stopped on purpose) respawns after
//! a short delay. Dropping out of that task kills the child via
//! `kill_on_drop`. While a turn is in flight further sends fail fast with
//! "already processing" — the busy lock is the per-session single-flight
//! guarantee.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::util::expand_tilde;

/// Whether a finished response is a real answer or a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Success,
    Error,
}

/// Events a worker emits to its multiplexer.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Child spawned and accepting input.
    Ready,
    /// A completed (or aborted) response.
    Message { kind: MessageKind, text: String },
    /// Turn finished; the busy lock has been released.
    Done,
    /// Worker-level failure (spawn error, stdin write failure).
    Error { message: String },
    /// Child exited with this code.
    Exit { code: i32 },
}

/// Accumulated per-worker usage, reset only by `restart`.
#[derive(Debug, Clone, Default)]
pub struct UsageStats {
    pub message_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub model: Option<String>,
    pub provider_session_id: Option<String>,
}

/// Knobs shared by all workers of one agent.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Assistant CLI binary path (`~` expanded at spawn time).
    pub cli_path: String,
    /// Delay before respawning a crashed child.
    pub restart_delay: Duration,
    /// Tools the CLI may use without asking. Empty means all of them
    /// (`--dangerously-skip-permissions`); the phone is no place to answer
    /// interactive permission prompts either way.
    pub allowed_tools: Vec<String>,
}

/// Handle to one session's CLI worker.
///
/// Cloneable — all clones drive the same child.
#[derive(Clone)]
pub struct SessionWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    session_id: u64,
    working_dir: PathBuf,
    config: WorkerConfig,
    events: mpsc::UnboundedSender<(u64, WorkerEvent)>,
    /// Single-flight lock: true from `send` until the turn's `result`.
    busy: AtomicBool,
    /// Set by stop/force_stop/restart to suppress the respawn loop.
    stopping: AtomicBool,
    /// True while a child process is alive.
    running: AtomicBool,
    stdin_tx: Mutex<Option<mpsc::Sender<String>>>,
    child_pid: Mutex<Option<u32>>,
    usage: Mutex<UsageStats>,
    run_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionWorker {
    pub fn new(
        session_id: u64,
        working_dir: PathBuf,
        config: WorkerConfig,
        events: mpsc::UnboundedSender<(u64, WorkerEvent)>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                session_id,
                working_dir,
                config,
                events,
                busy: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stdin_tx: Mutex::new(None),
                child_pid: Mutex::new(None),
                usage: Mutex::new(UsageStats::default()),
                run_task: Mutex::new(None),
            }),
        }
    }

    /// Spawn the child and the run loop that owns it.
    ///
    /// The first child is spawned before this returns, so a successful
    /// `start` means sends are accepted right away and a missing CLI binary
    /// fails the caller directly instead of surfacing as a delayed event.
    pub async fn start(&self) -> Result<(), String> {
        let mut task = self.inner.run_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err("Worker already running".to_string());
        }
        self.inner.stopping.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let first = WorkerInner::spawn_child(&inner).await?;

        *task = Some(tokio::spawn(async move {
            let mut current = Some(first);
            loop {
                let spawned = match current.take() {
                    Some(s) => s,
                    None => match WorkerInner::spawn_child(&inner).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(session = inner.session_id, "CLI respawn failed: {e}");
                            let _ = inner
                                .events
                                .send((inner.session_id, WorkerEvent::Error { message: e }));
                            if inner.stopping.load(Ordering::SeqCst) {
                                break;
                            }
                            tokio::time::sleep(inner.config.restart_delay).await;
                            continue;
                        }
                    },
                };

                let code = WorkerInner::pump_child(&inner, spawned).await;
                let _ = inner
                    .events
                    .send((inner.session_id, WorkerEvent::Exit { code }));
                if code != 0 {
                    warn!(session = inner.session_id, code, "CLI child exited");
                }

                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(inner.config.restart_delay).await;
                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                info!(session = inner.session_id, "Restarting CLI child");
            }
        }));
        Ok(())
    }

    /// Queue one user message. Fails fast while a turn is in flight.
    pub async fn send(&self, text: &str) -> Result<(), String> {
        if self.inner.busy.swap(true, Ordering::SeqCst) {
            return Err("already processing".to_string());
        }

        let line = json!({
            "type": "user",
            "message": {"role": "user", "content": text},
        })
        .to_string();

        let stdin = self.inner.stdin_tx.lock().await;
        let sent = match stdin.as_ref() {
            Some(tx) => tx.send(line).await.is_ok(),
            None => false,
        };
        drop(stdin);

        if sent {
            self.inner.usage.lock().await.message_count += 1;
            Ok(())
        } else {
            self.inner.busy.store(false, Ordering::SeqCst);
            Err("worker is not running".to_string())
        }
    }

    /// Graceful stop: close stdin, SIGTERM, escalate to SIGKILL after 3 s.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.stdin_tx.lock().await.take();

        let pid = *self.inner.child_pid.lock().await;
        let Some(pid) = pid else { return };
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while self.inner.running.load(Ordering::SeqCst) {
            if tokio::time::Instant::now() >= deadline {
                #[allow(clippy::cast_possible_wrap)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// SIGKILL, no grace.
    pub async fn force_stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.stdin_tx.lock().await.take();
        if let Some(pid) = *self.inner.child_pid.lock().await {
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }

    /// Stop-then-start. The only operation that resets usage counters.
    pub async fn restart(&self) -> Result<(), String> {
        self.stop().await;
        if let Some(task) = self.inner.run_task.lock().await.take() {
            let _ = task.await;
        }
        *self.inner.usage.lock().await = UsageStats::default();
        self.inner.busy.store(false, Ordering::SeqCst);
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub async fn usage(&self) -> UsageStats {
        self.inner.usage.lock().await.clone()
    }
}

/// A freshly spawned child plus the auxiliary tasks feeding its pipes.
struct SpawnedChild {
    child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    stdin_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
}

impl WorkerInner {
    /// Spawn one CLI child and wire its stdin/stderr. By the time this
    /// returns the worker accepts sends: stdin channel installed, `running`
    /// set, `ready` emitted.
    async fn spawn_child(inner: &Arc<WorkerInner>) -> Result<SpawnedChild, String> {
        let cli = expand_tilde(&inner.config.cli_path).into_owned();
        let mut args: Vec<String> = [
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--print",
            "--verbose",
        ]
        .map(String::from)
        .to_vec();
        if inner.config.allowed_tools.is_empty() {
            args.push("--dangerously-skip-permissions".to_string());
        } else {
            args.push("--allowedTools".to_string());
            args.push(inner.config.allowed_tools.join(","));
        }

        let mut child = Command::new(&cli)
            .args(&args)
            .current_dir(&inner.working_dir)
            .env("FORCE_COLOR", "0")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn {cli}: {e}"))?;

        let stdin = child.stdin.take().ok_or("Failed to take stdin pipe")?;
        let stdout = child.stdout.take().ok_or("Failed to take stdout pipe")?;
        let stderr = child.stderr.take().ok_or("Failed to take stderr pipe")?;

        *inner.child_pid.lock().await = child.id();

        // stdin writer: one JSON line per user message.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        *inner.stdin_tx.lock().await = Some(stdin_tx);
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // stderr: drop the CLI runtime's known-benign noise, log the rest.
        let sid = inner.session_id;
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty()
                    || line.contains("ExperimentalWarning")
                    || line.contains("punycode")
                {
                    continue;
                }
                debug!(session = sid, "CLI stderr: {line}");
            }
        });

        inner.running.store(true, Ordering::SeqCst);
        let _ = inner.events.send((inner.session_id, WorkerEvent::Ready));

        Ok(SpawnedChild {
            child,
            stdout,
            stdin_task,
            stderr_task,
        })
    }

    /// Drive one child from its first stdout line to reap. Returns the exit
    /// code. The run loop owns the child for its whole life; dropping out of
    /// it kills the process via `kill_on_drop`.
    async fn pump_child(inner: &Arc<WorkerInner>, spawned: SpawnedChild) -> i32 {
        let SpawnedChild {
            mut child,
            stdout,
            stdin_task,
            stderr_task,
        } = spawned;

        let mut response = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            Self::handle_line(inner, &line, &mut response).await;
        }

        // EOF. A turn still in flight means the child died mid-response:
        // surface the partial text as an error-flavored message, then close
        // the turn so queued work is not stranded behind a dead busy lock.
        let was_busy = inner.busy.swap(false, Ordering::SeqCst);
        if !response.is_empty() {
            let _ = inner.events.send((
                inner.session_id,
                WorkerEvent::Message {
                    kind: MessageKind::Error,
                    text: std::mem::take(&mut response),
                },
            ));
        }
        if was_busy {
            let _ = inner.events.send((inner.session_id, WorkerEvent::Done));
        }
        inner.running.store(false, Ordering::SeqCst);
        inner.stdin_tx.lock().await.take();
        *inner.child_pid.lock().await = None;

        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(session = inner.session_id, "CLI wait error: {e}");
                -1
            }
        };
        stdin_task.abort();
        stderr_task.abort();
        code
    }

    /// Dispatch one stdout line by its `type` tag.
    async fn handle_line(inner: &Arc<WorkerInner>, line: &str, response: &mut String) {
        let Ok(msg) = serde_json::from_str::<Value>(line) else {
            debug!(session = inner.session_id, "Unparseable CLI line: {line}");
            return;
        };

        match msg["type"].as_str().unwrap_or("") {
            "system" => {
                if msg["subtype"].as_str() == Some("init") {
                    let mut usage = inner.usage.lock().await;
                    if let Some(sid) = msg["session_id"].as_str() {
                        usage.provider_session_id = Some(sid.to_string());
                    }
                    if let Some(model) = msg["model"].as_str() {
                        usage.model = Some(model.to_string());
                    }
                }
            }
            "assistant" => {
                if let Some(blocks) = msg["message"]["content"].as_array() {
                    for block in blocks {
                        if block["type"].as_str() == Some("text") {
                            if let Some(text) = block["text"].as_str() {
                                response.push_str(text);
                            }
                        }
                    }
                }
            }
            "result" => {
                {
                    let mut usage = inner.usage.lock().await;
                    usage.cost_usd += msg["total_cost_usd"].as_f64().unwrap_or(0.0);
                    let turn = &msg["usage"];
                    usage.input_tokens += turn["input_tokens"].as_u64().unwrap_or(0)
                        + turn["cache_read_input_tokens"].as_u64().unwrap_or(0)
                        + turn["cache_creation_input_tokens"].as_u64().unwrap_or(0);
                    usage.output_tokens += turn["output_tokens"].as_u64().unwrap_or(0);
                }

                // The CLI flags failed turns (max-turns, execution errors)
                // on the result line itself.
                let failed = msg["is_error"].as_bool().unwrap_or(false)
                    || msg["subtype"].as_str().is_some_and(|s| s.starts_with("error"));
                let kind = if failed {
                    MessageKind::Error
                } else {
                    MessageKind::Success
                };

                let text = std::mem::take(response);
                inner.busy.store(false, Ordering::SeqCst);
                let _ = inner
                    .events
                    .send((inner.session_id, WorkerEvent::Message { kind, text }));
                let _ = inner.events.send((inner.session_id, WorkerEvent::Done));
            }
            _ => {}
        }
    }
}
