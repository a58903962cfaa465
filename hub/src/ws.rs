//! WebSocket dispatcher — one task per connected peer.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws`. No credentials are needed for the
//!    upgrade; the first useful frame must be `auth`.
//! 2. All frames are JSON objects with a `"type"` field.
//! 3. On disconnect the peer (if any) is told `peer_offline` and the
//!    connection is dropped from the registry. The room stays — the client
//!    reattaches later with `rejoin` instead of re-pairing.
//!
//! ## Frame types (client → hub)
//!
//! | Type        | Fields                              | Response                                  |
//! |-------------|-------------------------------------|-------------------------------------------|
//! | `auth`      | `token` = `"id:name:role"`          | `auth_success` or `auth_error`             |
//! | `ping`      | —                                   | `pong`                                     |
//! | `rejoin`    | `pairId` (`roomId` accepted)        | `paired`, `rejoin_success`, `rejoin_failed`|
//! | `message`   | `payload` = envelope                | relayed to peer verbatim                   |
//! | `session_*` | opaque                              | relayed to peer verbatim                   |
//!
//! Relayed frames are forwarded as the original text, so ingress and egress
//! are byte-for-byte identical. When the peer is offline the frame is
//! dropped silently — delivery is best-effort while both ends are live.

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::registry::Role;
use crate::state::HubState;
use crate::util::now_ms;

/// `GET /ws` — WebSocket upgrade handler.
pub async fn ws_upgrade(State(state): State<HubState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Identity established by a successful `auth` frame.
struct Authed {
    device_id: String,
    seq: u64,
}

/// Split an auth token into `(device_id, device_name, role)`.
///
/// The token is three colon-separated fields; the role must be `desktop` or
/// `web`. Device ids and names must be non-empty and colon-free.
fn parse_auth_token(token: &str) -> Option<(String, String, Role)> {
    let parts: Vec<&str> = token.split(':').collect();
    let [device_id, device_name, role] = parts.as_slice() else {
        return None;
    };
    if device_id.is_empty() || device_name.is_empty() {
        return None;
    }
    Role::parse(role).map(|r| ((*device_id).to_string(), (*device_name).to_string(), r))
}

/// Whether a frame type is relayed opaquely to the room peer.
fn is_relay_type(msg_type: &str) -> bool {
    matches!(
        msg_type,
        "message"
            | "session_list"
            | "session_create"
            | "session_created"
            | "session_switch"
            | "session_switched"
            | "session_delete"
            | "session_deleted"
            | "session_error"
    )
}

async fn send_json(tx: &mpsc::Sender<String>, frame: Value) {
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = tx.send(text).await;
    }
}

/// Main per-connection event loop.
///
/// Outgoing frames are funneled through an mpsc channel so state code can
/// queue sends without holding a reference to the socket; a dedicated task
/// pumps the channel into the sink. The close [`Notify`] lets the registry
/// (displacement) and the reaper (heartbeat timeout) terminate the loop.
#[allow(clippy::too_many_lines)]
async fn handle_ws(socket: axum::extract::ws::WebSocket, state: HubState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let close = Arc::new(Notify::new());

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut authed: Option<Authed> = None;

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    axum::extract::ws::Message::Text(text) => {
                        handle_frame(&state, &tx, &close, &mut authed, &text).await;
                    }
                    axum::extract::ws::Message::Close(_) => break,
                    _ => {}
                }
            }
            // Fired on displacement by a second auth or by the reaper.
            () = close.notified() => break,
        }
    }

    if let Some(auth) = authed {
        disconnect(&state, &auth).await;
    }
    send_task.abort();
}

/// Dispatch one inbound text frame.
async fn handle_frame(
    state: &HubState,
    tx: &mpsc::Sender<String>,
    close: &Arc<Notify>,
    authed: &mut Option<Authed>,
    text: &str,
) {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        send_json(
            tx,
            json!({"type": "error", "message": "Failed to parse JSON message"}),
        )
        .await;
        return;
    };
    let msg_type = parsed["type"].as_str().unwrap_or("");

    match msg_type {
        "auth" => {
            if authed.is_some() {
                send_json(
                    tx,
                    json!({"type": "auth_error", "message": "Already authenticated"}),
                )
                .await;
                return;
            }
            let token = parsed["token"].as_str().unwrap_or("");
            let Some((device_id, device_name, role)) = parse_auth_token(token) else {
                send_json(
                    tx,
                    json!({"type": "auth_error", "message": "Malformed auth token"}),
                )
                .await;
                return;
            };

            let seq = state
                .registry
                .insert(&device_id, &device_name, role, tx.clone(), Arc::clone(close), now_ms())
                .await;
            info!(device_id = %device_id, role = role.as_str(), "Device authenticated");
            *authed = Some(Authed {
                device_id: device_id.clone(),
                seq,
            });
            send_json(tx, json!({"type": "auth_success", "deviceId": device_id})).await;
        }
        "ping" => {
            if let Some(auth) = authed.as_ref() {
                state.registry.touch_ping(&auth.device_id, now_ms()).await;
            }
            send_json(tx, json!({"type": "pong"})).await;
        }
        "rejoin" => {
            let room_id = parsed["pairId"]
                .as_str()
                .or_else(|| parsed["roomId"].as_str())
                .unwrap_or("");
            handle_rejoin(state, tx, authed.as_ref(), room_id).await;
        }
        t if is_relay_type(t) => {
            relay(state, authed.as_ref(), tx, text).await;
        }
        _ => {
            send_json(
                tx,
                json!({"type": "error", "message": format!("Unknown message type: {msg_type}")}),
            )
            .await;
        }
    }
}

/// Reattach an authenticated device to its room after a reconnect.
async fn handle_rejoin(
    state: &HubState,
    tx: &mpsc::Sender<String>,
    authed: Option<&Authed>,
    room_id: &str,
) {
    let Some(auth) = authed else {
        send_json(
            tx,
            json!({"type": "rejoin_failed", "reason": "Not authenticated"}),
        )
        .await;
        return;
    };

    let Some(room) = state.rooms.get(room_id).await else {
        send_json(
            tx,
            json!({"type": "rejoin_failed", "reason": "Room not found"}),
        )
        .await;
        return;
    };

    if !room.contains(&auth.device_id) {
        send_json(
            tx,
            json!({"type": "rejoin_failed", "reason": "Device not in room"}),
        )
        .await;
        return;
    }

    // Repeated rejoin on the same socket is a no-op for the peer: only the
    // unbound→bound transition re-announces the pairing.
    let newly_bound = state.registry.room_of(&auth.device_id).await.as_deref() != Some(room_id);
    state.registry.set_room(&auth.device_id, Some(room_id)).await;
    state.rooms.touch(room_id, now_ms()).await;

    let peer_id = room.peer_of(&auth.device_id).unwrap_or_default().to_string();
    let peer_tx = state.registry.sender_in_room(&peer_id, room_id).await;

    match peer_tx {
        Some(peer_tx) => {
            info!(device_id = %auth.device_id, room_id = %room_id, "Device rejoined, peer online");
            send_json(tx, json!({"type": "paired", "pairId": room_id})).await;
            if newly_bound {
                send_json(&peer_tx, json!({"type": "paired", "pairId": room_id})).await;
            }
        }
        None => {
            info!(device_id = %auth.device_id, room_id = %room_id, "Device rejoined, peer offline");
            send_json(
                tx,
                json!({"type": "rejoin_success", "pairId": room_id, "peerOnline": false}),
            )
            .await;
        }
    }
}

/// Forward a `message` or `session_*` frame to the room peer, verbatim.
async fn relay(state: &HubState, authed: Option<&Authed>, tx: &mpsc::Sender<String>, text: &str) {
    let Some(auth) = authed else {
        send_json(tx, json!({"type": "error", "message": "Not authenticated"})).await;
        return;
    };

    let Some(room_id) = state.registry.room_of(&auth.device_id).await else {
        send_json(tx, json!({"type": "error", "message": "Not paired"})).await;
        return;
    };

    let Some(room) = state.rooms.get(&room_id).await else {
        send_json(tx, json!({"type": "error", "message": "Not paired"})).await;
        return;
    };
    state.rooms.touch(&room_id, now_ms()).await;

    let peer_id = room.peer_of(&auth.device_id).unwrap_or_default();
    match state.registry.sender_in_room(peer_id, &room_id).await {
        Some(peer_tx) => {
            let _ = peer_tx.send(text.to_string()).await;
        }
        None => {
            // Best-effort: the peer already saw peer_offline.
            debug!(device_id = %auth.device_id, "Dropping frame, peer offline");
        }
    }
}

/// Close path: drop the registry entry and tell the peer, exactly once.
async fn disconnect(state: &HubState, auth: &Authed) {
    // remove_if returns None when a newer connection for the same device has
    // displaced this one — the replacement owns the registry entry now and
    // no peer notification is due from us.
    let Some(room_binding) = state.registry.remove_if(&auth.device_id, auth.seq).await else {
        return;
    };
    info!(device_id = %auth.device_id, "Device disconnected");

    let Some(room_id) = room_binding else { return };
    let Some(room) = state.rooms.get(&room_id).await else {
        return;
    };
    let peer_id = room.peer_of(&auth.device_id).unwrap_or_default();
    if let Some(peer_tx) = state.registry.sender_in_room(peer_id, &room_id).await {
        send_json(&peer_tx, json!({"type": "peer_offline"})).await;
    }
}

#[cfg(test)]
mod tests {
    use super::{is_relay_type, parse_auth_token};
    use crate::registry::Role;

    #[test]
    fn auth_token_parses_three_fields() {
        let (id, name, role) = parse_auth_token("D1:My Desk:desktop").unwrap();
        assert_eq!(id, "D1");
        assert_eq!(name, "My Desk");
        assert_eq!(role, Role::Desktop);

        let (_, _, role) = parse_auth_token("P1:Phone:web").unwrap();
        assert_eq!(role, Role::Web);
    }

    #[test]
    fn auth_token_rejects_malformed_input() {
        assert!(parse_auth_token("").is_none());
        assert!(parse_auth_token("D1:Desk").is_none());
        assert!(parse_auth_token("D1:Desk:admin").is_none());
        assert!(parse_auth_token(":Desk:desktop").is_none());
        assert!(parse_auth_token("D1::desktop").is_none());
        assert!(parse_auth_token("D1:a:b:desktop").is_none());
    }

    #[test]
    fn relay_type_set_is_closed() {
        for t in [
            "message",
            "session_list",
            "session_create",
            "session_created",
            "session_switch",
            "session_switched",
            "session_delete",
            "session_deleted",
            "session_error",
        ] {
            assert!(is_relay_type(t), "{t} should relay");
        }
        assert!(!is_relay_type("auth"));
        assert!(!is_relay_type("session_destroy"));
        assert!(!is_relay_type(""));
    }
}
