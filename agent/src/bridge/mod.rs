//! Single-operator chat-front-end glue.
//!
//! The bridge sits between one chat operator and the session multiplexer:
//!
//! - **Auth gate** — an unknown operator is prompted for the shared secret;
//!   until it matches, nothing reaches the sessions. Comparison is
//!   constant-time so response timing leaks nothing about the secret.
//! - **Busy queue** — text that arrives while the active session is busy is
//!   queued FIFO and dispatched one entry per `done` event. The queue
//!   belongs to the active session: `/stop` and `/restart` clear it, and so
//!   does `/switch`, since entries accepted for one session must not leak
//!   into another.
//! - **Output tagging** — every outbound chunk is prefixed with the session
//!   name so interleaved sessions stay attributable, then size-limited via
//!   [`crate::codec::split_message`].
//!
//! The chat transport itself is not the bridge's business: it consumes
//! operator lines via [`Bridge::handle_operator_line`] and produces rendered
//! chunks on an outbound channel. `tether-agent console` wires those to
//! stdin/stdout.

pub mod commands;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::codec::{escape_html, split_message};
use crate::config::BridgeConfig;
use crate::sessions::worker::MessageKind;
use crate::sessions::{MuxEvent, SessionMux};

/// Prompt shown to unauthenticated operators.
const AUTH_PROMPT: &str = "🔐 please enter password";

struct BridgeState {
    /// Operator identities that have presented the secret.
    authed: HashSet<String>,
    /// Operators already shown the password prompt.
    prompted: HashSet<String>,
    /// Messages waiting on the active session's busy lock.
    queue: VecDeque<String>,
}

/// Front-end glue between one operator stream and the session multiplexer.
///
/// Cloneable — all clones share the same gate and queue.
#[derive(Clone)]
pub struct Bridge {
    mux: SessionMux,
    state: Arc<Mutex<BridgeState>>,
    out: mpsc::UnboundedSender<String>,
    secret: Arc<String>,
    chunk_limit: usize,
    html_markup: bool,
}

impl Bridge {
    /// Build a bridge and start its session-event pump. Rendered chunks go
    /// to `out`.
    #[must_use]
    pub fn new(mux: SessionMux, config: &BridgeConfig, out: mpsc::UnboundedSender<String>) -> Self {
        let bridge = Self {
            mux,
            state: Arc::new(Mutex::new(BridgeState {
                authed: HashSet::new(),
                prompted: HashSet::new(),
                queue: VecDeque::new(),
            })),
            out,
            secret: Arc::new(config.password.clone()),
            chunk_limit: config.chunk_limit,
            html_markup: config.html_markup,
        };
        bridge.spawn_event_pump();
        bridge
    }

    /// Process one inbound operator line (auth gate, commands, session text).
    pub async fn handle_operator_line(&self, operator: &str, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if !self.gate(operator, line).await {
            return;
        }

        if line.starts_with('/') {
            for text in self.handle_command(line).await {
                self.emit(&text);
            }
            return;
        }

        // A non-empty queue means earlier messages are still waiting their
        // turn; new text appends behind them rather than jumping ahead.
        {
            let mut state = self.state.lock().await;
            if !state.queue.is_empty() {
                state.queue.push_back(line.to_string());
                let position = state.queue.len();
                drop(state);
                self.emit(&format!("queued (position {position})"));
                return;
            }
        }

        match self.mux.send_active(line).await {
            Ok(_) => {}
            Err(e) if e == "Session is busy" => {
                let mut state = self.state.lock().await;
                state.queue.push_back(line.to_string());
                let position = state.queue.len();
                drop(state);
                self.emit(&format!("queued (position {position})"));
            }
            Err(e) => self.emit(&format!("error: {e}")),
        }
    }

    /// Authentication gate. Returns true when the line may proceed.
    async fn gate(&self, operator: &str, line: &str) -> bool {
        if self.secret.is_empty() {
            return true;
        }

        let mut state = self.state.lock().await;
        if state.authed.contains(operator) {
            return true;
        }

        if !state.prompted.contains(operator) {
            state.prompted.insert(operator.to_string());
            drop(state);
            self.emit(AUTH_PROMPT);
            return false;
        }

        // Prompted already. Commands are never password attempts.
        if line.starts_with('/') {
            drop(state);
            self.emit("please authenticate first");
            return false;
        }

        if constant_time_eq(self.secret.as_bytes(), line.as_bytes()) {
            state.authed.insert(operator.to_string());
            drop(state);
            info!(operator = %operator, "Operator authenticated");
            self.emit("authenticated");
        } else {
            drop(state);
            warn!(operator = %operator, "Operator auth failure");
            self.emit(AUTH_PROMPT);
        }
        false
    }

    /// Forget queued messages (used by `/stop` and `/restart`).
    pub(crate) async fn clear_queue(&self) -> usize {
        let mut state = self.state.lock().await;
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    pub(crate) async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub(crate) fn mux(&self) -> &SessionMux {
        &self.mux
    }

    /// Chunk and push one message to the front-end. Escaping happens per
    /// chunk, after splitting, so a cut can never land inside an emitted
    /// entity like `&amp;`.
    fn emit(&self, text: &str) {
        for chunk in split_message(text, self.chunk_limit) {
            let chunk = if self.html_markup {
                escape_html(&chunk)
            } else {
                chunk
            };
            let _ = self.out.send(chunk);
        }
    }

    /// Translate session events into operator-facing text and drain the
    /// queue one entry per `done`.
    fn spawn_event_pump(&self) {
        let bridge = self.clone();
        let mut events = self.mux.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    MuxEvent::SessionMessage { id, kind, text } => {
                        let name = bridge.mux.name_of(id).await.unwrap_or_else(|| id.to_string());
                        match kind {
                            MessageKind::Success => bridge.emit(&format!("[{name}] {text}")),
                            MessageKind::Error => {
                                bridge.emit(&format!("[{name}] error: {text}"));
                            }
                        }
                    }
                    MuxEvent::SessionDone { id } => {
                        bridge.drain_queue(id).await;
                    }
                    MuxEvent::SessionError { id, error } => {
                        let name = bridge.mux.name_of(id).await.unwrap_or_else(|| id.to_string());
                        bridge.emit(&format!("[{name}] error: {error}"));
                    }
                    MuxEvent::SessionExited { id, code } if code != 0 => {
                        let name = bridge.mux.name_of(id).await.unwrap_or_else(|| id.to_string());
                        bridge.emit(&format!("[{name}] assistant exited with code {code}"));
                    }
                    _ => {}
                }
            }
        });
    }

    /// Dispatch the queue head after a turn completes on the active session.
    async fn drain_queue(&self, done_id: u64) {
        let Some((active_id, _)) = self.mux.active().await else {
            return;
        };
        if active_id != done_id {
            return;
        }

        let next = self.state.lock().await.queue.pop_front();
        let Some(text) = next else { return };
        match self.mux.send_active(&text).await {
            Ok(_) => {}
            Err(e) if e == "Session is busy" => {
                // Lost the race with a concurrent send; retry on the next done.
                self.state.lock().await.queue.push_front(text);
            }
            Err(e) => self.emit(&format!("error sending queued message: {e}")),
        }
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot learn the secret length from
/// response times.
fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::constant_time_eq;

    #[test]
    fn constant_time_eq_compares_correctly() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"Secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secretx"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }
}
