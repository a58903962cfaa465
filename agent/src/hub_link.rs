//! Hub link — outbound WS connection from the agent to the hub.
//!
//! Spawned on startup. Maintains a persistent WebSocket to the hub with
//! exponential-backoff reconnect and a heartbeat ping task. After `auth` it
//! issues `rejoin` with the remembered room id, so a restarted agent
//! reattaches without the user re-pairing; on `rejoin_failed` (or
//! `unpaired`) it requests a fresh pair code over HTTP and logs it for the
//! user to type into the phone.
//!
//! Inbound `message` frames are routed to the session addressed by the
//! envelope's `sessionId`; inbound `session_*` control frames drive the
//! multiplexer. Multiplexer events flow back as `message` /
//! `session_created` / `session_switched` / `session_deleted` /
//! `session_error` frames carrying the originating session id.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::persist;
use crate::sessions::worker::MessageKind;
use crate::sessions::{MuxEvent, SessionMux};
use crate::stats::{LinkEventType, LinkStats};
use crate::util::now_ms;

/// Type alias for the WS sink to reduce verbosity.
type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            tokio_tungstenite::tungstenite::Message,
        >,
    >,
>;

/// Spawn the hub link task. Returns a `JoinHandle` that runs until cancelled.
pub fn spawn(
    config: Arc<Config>,
    mux: SessionMux,
    device_id: String,
    data_dir: PathBuf,
    stats: Arc<LinkStats>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(link_loop(config, mux, device_id, data_dir, stats))
}

/// Main loop: connect, handle messages, reconnect on failure.
async fn link_loop(
    config: Arc<Config>,
    mux: SessionMux,
    device_id: String,
    data_dir: PathBuf,
    stats: Arc<LinkStats>,
) {
    let mut delay = Duration::from_secs(config.hub.reconnect_delay_secs);
    let max_delay = Duration::from_secs(config.hub.reconnect_max_delay_secs);

    loop {
        info!("Hub link: connecting to {}", config.hub.url);
        match connect_and_run(&config, &mux, &device_id, &data_dir, &stats).await {
            Ok(()) => {
                info!("Hub link: connection closed, reconnecting...");
                delay = Duration::from_secs(config.hub.reconnect_delay_secs);
            }
            Err(e) => {
                warn!(
                    "Hub link: connection error: {e}, reconnecting in {}s",
                    delay.as_secs()
                );
            }
        }
        stats.connected.store(false, Ordering::Relaxed);
        stats.reconnects.fetch_add(1, Ordering::Relaxed);
        stats
            .push_event(LinkEventType::ReconnectAttempt, stats.summary())
            .await;
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

async fn send_frame(sink: &WsSink, stats: &LinkStats, frame: Value) {
    let mut sink = sink.lock().await;
    if sink
        .send(tokio_tungstenite::tungstenite::Message::Text(
            frame.to_string().into(),
        ))
        .await
        .is_ok()
    {
        stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// A single connection attempt: connect, auth, rejoin, pump until disconnect.
#[allow(clippy::too_many_lines)]
async fn connect_and_run(
    config: &Arc<Config>,
    mux: &SessionMux,
    device_id: &str,
    data_dir: &std::path::Path,
    stats: &Arc<LinkStats>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(config.hub.url.as_str()).await?;
    let (ws_sink, mut ws_stream) = ws_stream.split();
    let ws_sink: WsSink = Arc::new(Mutex::new(ws_sink));

    stats.connected.store(true, Ordering::Relaxed);
    stats
        .push_event(LinkEventType::Connected, config.hub.url.clone())
        .await;

    info!("Hub link: connected, authenticating...");
    send_frame(
        &ws_sink,
        stats,
        json!({
            "type": "auth",
            "token": format!("{device_id}:{}:desktop", config.device.name),
        }),
    )
    .await;

    // Heartbeat task
    let heartbeat_sink = Arc::clone(&ws_sink);
    let heartbeat_stats = Arc::clone(stats);
    let heartbeat_interval = Duration::from_secs(config.hub.heartbeat_interval_secs);
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        loop {
            interval.tick().await;
            send_frame(&heartbeat_sink, &heartbeat_stats, json!({"type": "ping"})).await;
        }
    });

    let mut events = mux.subscribe();
    let mut link_result: Result<(), Box<dyn std::error::Error + Send + Sync>> = Ok(());

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        link_result = Err(e.into());
                        break;
                    }
                };
                match msg {
                    tokio_tungstenite::tungstenite::Message::Text(text) => {
                        stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                            warn!("Hub link: unparseable frame");
                            continue;
                        };
                        handle_hub_frame(config, mux, &ws_sink, device_id, data_dir, stats, &parsed)
                            .await;
                    }
                    tokio_tungstenite::tungstenite::Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    forward_mux_event(&ws_sink, stats, &event).await;
                }
            }
        }
    }

    heartbeat_task.abort();
    stats
        .push_event(LinkEventType::Disconnected, stats.summary())
        .await;
    info!("Hub link: {}", stats.summary());
    link_result
}

/// Dispatch one frame from the hub.
async fn handle_hub_frame(
    config: &Arc<Config>,
    mux: &SessionMux,
    ws_sink: &WsSink,
    device_id: &str,
    data_dir: &std::path::Path,
    stats: &LinkStats,
    frame: &Value,
) {
    let msg_type = frame["type"].as_str().unwrap_or("");
    match msg_type {
        "auth_success" => {
            info!("Hub link: authenticated");
            let state = persist::load(data_dir);
            match state.room_id {
                Some(room_id) => {
                    info!(room_id = %room_id, "Hub link: rejoining room");
                    send_frame(ws_sink, stats, json!({"type": "rejoin", "pairId": room_id})).await;
                }
                None => request_pair_code(config, device_id, stats).await,
            }
        }
        "auth_error" => {
            warn!(
                "Hub link: auth rejected: {}",
                frame["message"].as_str().unwrap_or("unknown")
            );
            stats
                .push_event(
                    LinkEventType::AuthFailed,
                    frame["message"].as_str().unwrap_or("unknown").to_string(),
                )
                .await;
        }
        "paired" => {
            let room_id = frame["pairId"].as_str().unwrap_or("");
            info!(room_id = %room_id, "Hub link: paired with phone");
            let mut state = persist::load(data_dir);
            state.room_id = Some(room_id.to_string());
            persist::save(data_dir, &state);
        }
        "rejoin_success" => {
            info!("Hub link: rejoined room, peer offline");
        }
        "rejoin_failed" => {
            warn!(
                "Hub link: rejoin failed: {}",
                frame["reason"].as_str().unwrap_or("unknown")
            );
            let mut state = persist::load(data_dir);
            state.room_id = None;
            persist::save(data_dir, &state);
            request_pair_code(config, device_id, stats).await;
        }
        "unpaired" => {
            info!("Hub link: room evicted by hub");
            let mut state = persist::load(data_dir);
            state.room_id = None;
            persist::save(data_dir, &state);
            request_pair_code(config, device_id, stats).await;
        }
        "peer_offline" => info!("Hub link: phone went offline"),
        "pong" => {
            stats.last_pong_at.store(now_ms(), Ordering::Relaxed);
            debug!("Hub link: pong");
        }
        "error" => warn!(
            "Hub link: hub error: {}",
            frame["message"].as_str().unwrap_or("unknown")
        ),
        "message" => {
            let session_id = frame["payload"]["sessionId"].as_str().unwrap_or("");
            let content = frame["payload"]["content"].as_str().unwrap_or("");
            if let Err(e) = mux.send_to(session_id, content).await {
                send_frame(
                    ws_sink,
                    stats,
                    json!({"type": "session_error", "sessionId": session_id, "error": e}),
                )
                .await;
            }
        }
        "session_list" => {
            let sessions = mux.list().await;
            let rows: Vec<Value> = sessions
                .iter()
                .map(|s| {
                    json!({
                        "id": s.id.to_string(),
                        "name": s.name,
                        "workingDirectory": s.working_directory,
                        "status": s.status.as_str(),
                        "isActive": s.is_active,
                        "messageCount": s.message_count,
                        "runningMinutes": s.running_minutes,
                    })
                })
                .collect();
            send_frame(ws_sink, stats, json!({"type": "session_list", "sessions": rows})).await;
        }
        "session_create" => {
            let name = frame["name"].as_str().filter(|n| !n.is_empty());
            let dir = frame["workingDirectory"].as_str().filter(|d| !d.is_empty());
            if let Err(e) = mux.create(name, dir).await {
                send_frame(ws_sink, stats, json!({"type": "session_error", "error": e})).await;
            }
            // Success is announced by the SessionCreated event.
        }
        "session_switch" => {
            let target = frame["sessionId"].as_str().unwrap_or("");
            if let Err(e) = mux.switch(target).await {
                send_frame(
                    ws_sink,
                    stats,
                    json!({"type": "session_error", "sessionId": target, "error": e}),
                )
                .await;
            }
        }
        "session_delete" => {
            let target = frame["sessionId"].as_str().unwrap_or("");
            let result = match (target.is_empty(), target.parse::<u64>()) {
                (true, _) => mux.close(None).await,
                (false, Ok(id)) => mux.close(Some(id)).await,
                (false, Err(_)) => Err(format!("Session not found: {target}")),
            };
            if let Err(e) = result {
                send_frame(
                    ws_sink,
                    stats,
                    json!({"type": "session_error", "sessionId": target, "error": e}),
                )
                .await;
            }
        }
        _ => debug!("Hub link: ignoring frame type {msg_type}"),
    }
}

/// Frame multiplexer events for the phone.
async fn forward_mux_event(ws_sink: &WsSink, stats: &LinkStats, event: &MuxEvent) {
    match event {
        MuxEvent::SessionMessage { id, kind, text } => {
            let content = match kind {
                MessageKind::Success => text.clone(),
                MessageKind::Error => format!("error: {text}"),
            };
            send_frame(
                ws_sink,
                stats,
                json!({
                    "type": "message",
                    "payload": {
                        "id": uuid::Uuid::new_v4().to_string(),
                        "content": content,
                        "timestamp": now_ms(),
                        "sessionId": id.to_string(),
                    }
                }),
            )
            .await;
        }
        MuxEvent::SessionCreated { id, name } => {
            send_frame(
                ws_sink,
                stats,
                json!({
                    "type": "session_created",
                    "session": {"id": id.to_string(), "name": name},
                }),
            )
            .await;
        }
        MuxEvent::SessionSwitched { id, .. } => {
            send_frame(
                ws_sink,
                stats,
                json!({"type": "session_switched", "sessionId": id.to_string()}),
            )
            .await;
        }
        MuxEvent::SessionClosed { id, .. } => {
            send_frame(
                ws_sink,
                stats,
                json!({"type": "session_deleted", "sessionId": id.to_string()}),
            )
            .await;
        }
        MuxEvent::SessionError { id, error } => {
            send_frame(
                ws_sink,
                stats,
                json!({"type": "session_error", "sessionId": id.to_string(), "error": error}),
            )
            .await;
        }
        MuxEvent::SessionExited { id, code } if *code != 0 => {
            send_frame(
                ws_sink,
                stats,
                json!({
                    "type": "session_error",
                    "sessionId": id.to_string(),
                    "error": format!("assistant exited with code {code}"),
                }),
            )
            .await;
        }
        _ => {}
    }
}

/// Ask the hub for a fresh pair code and log it for the user.
async fn request_pair_code(config: &Arc<Config>, device_id: &str, stats: &LinkStats) {
    let url = format!(
        "{}/api/pair/request",
        config.hub.http_url.trim_end_matches('/')
    );
    let body = json!({
        "deviceId": device_id,
        "deviceName": config.device.name,
        "platform": "desktop",
    });

    let client = reqwest::Client::new();
    match client.post(&url).json(&body).send().await {
        Ok(resp) => match resp.json::<Value>().await {
            Ok(data) if data["success"] == true => {
                let code = data["data"]["pairCode"].as_str().unwrap_or("?");
                info!("Pair code: {code} — enter it on your phone within 5 minutes");
                stats
                    .push_event(LinkEventType::PairCodeIssued, code.to_string())
                    .await;
            }
            Ok(data) => warn!(
                "Pair request rejected: {}",
                data["error"].as_str().unwrap_or("unknown")
            ),
            Err(e) => warn!("Pair request: bad response: {e}"),
        },
        Err(e) => warn!("Pair request failed: {e}"),
    }
}
