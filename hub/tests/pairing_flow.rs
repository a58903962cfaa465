//! Loopback hub tests: a real hub bound to an ephemeral port, driven by
//! plain HTTP and WebSocket clients the way the desktop agent and phone do.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tether_hub::{Config, HubState};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_hub() -> SocketAddr {
    let mut config = Config::default();
    config.server.listen = "127.0.0.1:0".to_string();
    let state = HubState::new(config);
    let app = tether_hub::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn send_frame(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

/// Next JSON frame from the socket, with a test-failure timeout.
async fn recv_frame(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(_) => panic!("socket closed while waiting for frame"),
            _ => {}
        }
    }
}

/// Raw text of the next frame — for byte-for-byte relay assertions.
async fn recv_text(ws: &mut Ws) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return text.to_string();
        }
    }
}

/// Connect and authenticate a device; returns the open socket.
async fn connect_device(addr: SocketAddr, device_id: &str, name: &str, role: &str) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    send_frame(&mut ws, json!({"type": "auth", "token": format!("{device_id}:{name}:{role}")})).await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["deviceId"], device_id);
    ws
}

async fn request_pair_code(addr: SocketAddr, device_id: &str, name: &str, platform: &str) -> String {
    let resp: Value = reqwest::Client::new()
        .post(format!("http://{addr}/api/pair/request"))
        .json(&json!({"deviceId": device_id, "deviceName": name, "platform": platform}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
    resp["data"]["pairCode"].as_str().unwrap().to_string()
}

async fn confirm_pair(addr: SocketAddr, code: &str, device_id: &str, name: &str) -> Value {
    let resp: Value = reqwest::Client::new()
        .post(format!("http://{addr}/api/pair/confirm"))
        .json(&json!({"pairCode": code, "deviceId": device_id, "deviceName": name}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["success"], true);
    resp["data"].clone()
}

/// Pair a fresh desktop + phone; returns both sockets and the pair id.
async fn paired_peers(addr: SocketAddr) -> (Ws, Ws, String) {
    let mut desktop = connect_device(addr, "D1", "Desk", "desktop").await;
    let mut phone = connect_device(addr, "P1", "Phone", "web").await;

    let code = request_pair_code(addr, "D1", "Desk", "desktop").await;
    let data = confirm_pair(addr, &code, "P1", "Phone").await;
    assert_eq!(data["success"], true);
    let pair_id = data["pairId"].as_str().unwrap().to_string();

    let d = recv_frame(&mut desktop).await;
    assert_eq!(d["type"], "paired");
    assert_eq!(d["pairId"], pair_id.as_str());
    let p = recv_frame(&mut phone).await;
    assert_eq!(p["type"], "paired");
    assert_eq!(p["pairId"], pair_id.as_str());

    (desktop, phone, pair_id)
}

#[tokio::test]
async fn happy_path_pairing() {
    let addr = start_hub().await;
    let mut desktop = connect_device(addr, "D1", "Desk", "desktop").await;
    let mut phone = connect_device(addr, "P1", "Phone", "web").await;

    let code = request_pair_code(addr, "D1", "Desk", "desktop").await;
    assert_eq!(code.len(), 9);
    assert_eq!(&code[4..5], "-");

    // Confirm with the lowercase spelling — normalization resolves it.
    let data = confirm_pair(addr, &code.to_lowercase(), "P1", "Phone").await;
    assert_eq!(data["success"], true);
    let pair_id = data["pairId"].as_str().unwrap();

    let d = recv_frame(&mut desktop).await;
    assert_eq!(d["type"], "paired");
    assert_eq!(d["pairId"], pair_id);
    let p = recv_frame(&mut phone).await;
    assert_eq!(p["type"], "paired");
    assert_eq!(p["pairId"], pair_id);

    // The code is single-use.
    let again = confirm_pair(addr, &code, "P2", "Phone2").await;
    assert_eq!(again["success"], false);
    assert_eq!(again["error"], "Invalid pair code");
}

#[tokio::test]
async fn rejoin_after_desktop_reconnect() {
    let addr = start_hub().await;
    let (desktop, mut phone, pair_id) = paired_peers(addr).await;

    drop(desktop);
    let offline = recv_frame(&mut phone).await;
    assert_eq!(offline["type"], "peer_offline");

    // Reconnect and rejoin — no new pair code involved.
    let mut desktop = connect_device(addr, "D1", "Desk", "desktop").await;
    send_frame(&mut desktop, json!({"type": "rejoin", "pairId": pair_id})).await;

    let d = recv_frame(&mut desktop).await;
    assert_eq!(d["type"], "paired");
    assert_eq!(d["pairId"], pair_id.as_str());
    let p = recv_frame(&mut phone).await;
    assert_eq!(p["type"], "paired");
    assert_eq!(p["pairId"], pair_id.as_str());
}

#[tokio::test]
async fn repeated_rejoin_does_not_renotify_the_peer() {
    let addr = start_hub().await;
    let (mut desktop, mut phone, pair_id) = paired_peers(addr).await;

    // Rejoin on an already-bound socket: the sender gets its confirmation,
    // the peer is left alone.
    send_frame(&mut desktop, json!({"type": "rejoin", "pairId": pair_id})).await;
    let d = recv_frame(&mut desktop).await;
    assert_eq!(d["type"], "paired");

    // If the phone had been re-notified, that frame would arrive before the
    // relayed one below.
    let probe = r#"{"type":"message","payload":{"id":"p","content":"probe","timestamp":9,"sessionId":"1"}}"#;
    desktop.send(Message::Text(probe.into())).await.unwrap();
    assert_eq!(recv_text(&mut phone).await, probe);
}

#[tokio::test]
async fn rejoin_with_unknown_room_fails() {
    let addr = start_hub().await;
    let mut desktop = connect_device(addr, "D1", "Desk", "desktop").await;

    send_frame(&mut desktop, json!({"type": "rejoin", "pairId": "no-such-room"})).await;
    let reply = recv_frame(&mut desktop).await;
    assert_eq!(reply["type"], "rejoin_failed");
    assert_eq!(reply["reason"], "Room not found");
}

#[tokio::test]
async fn cross_role_confirm_is_rejected_and_code_survives() {
    let addr = start_hub().await;
    let code = request_pair_code(addr, "D1", "Desk", "desktop").await;

    // A second desktop tries to redeem the desktop's code.
    let resp: Value = reqwest::Client::new()
        .post(format!("http://{addr}/api/pair/confirm"))
        .json(&json!({
            "pairCode": code, "deviceId": "D2", "deviceName": "Desk2",
            "platform": "desktop",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["data"]["success"], false);
    assert_eq!(resp["data"]["error"], "Cannot pair same device types");

    // The code is still redeemable from the phone side.
    let data = confirm_pair(addr, &code, "P1", "Phone").await;
    assert_eq!(data["success"], true);
}

#[tokio::test]
async fn pair_request_rejects_bad_input() {
    let addr = start_hub().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/pair/request"))
        .json(&json!({"deviceId": "D1", "deviceName": "Desk", "platform": "tablet"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("http://{addr}/api/pair/request"))
        .json(&json!({"deviceName": "Desk", "platform": "desktop"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn relay_is_byte_for_byte_and_ordered() {
    let addr = start_hub().await;
    let (mut desktop, mut phone, _) = paired_peers(addr).await;

    let first = r#"{"type":"message","payload":{"id":"x","content":"hello","timestamp":1,"sessionId":"1"}}"#;
    let second = r#"{"type":"session_create","name":"proj-a"}"#;
    phone.send(Message::Text(first.into())).await.unwrap();
    phone.send(Message::Text(second.into())).await.unwrap();

    // Sender order is preserved and no byte is touched in transit.
    assert_eq!(recv_text(&mut desktop).await, first);
    assert_eq!(recv_text(&mut desktop).await, second);

    // And the reverse direction, tagged with the session id.
    let reply = r#"{"type":"message","payload":{"id":"y","content":"hi","timestamp":2,"sessionId":"1"}}"#;
    desktop.send(Message::Text(reply.into())).await.unwrap();
    assert_eq!(recv_text(&mut phone).await, reply);
}

#[tokio::test]
async fn frames_to_offline_peer_are_dropped_silently() {
    let addr = start_hub().await;
    let (desktop, mut phone, _) = paired_peers(addr).await;

    drop(desktop);
    let offline = recv_frame(&mut phone).await;
    assert_eq!(offline["type"], "peer_offline");

    send_frame(
        &mut phone,
        json!({"type": "message", "payload": {"id": "x", "content": "anyone?", "timestamp": 3, "sessionId": "1"}}),
    )
    .await;

    // No error frame comes back; the connection keeps working.
    send_frame(&mut phone, json!({"type": "ping"})).await;
    let reply = recv_frame(&mut phone).await;
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn second_auth_displaces_first_connection() {
    let addr = start_hub().await;
    let mut first = connect_device(addr, "D1", "Desk", "desktop").await;
    let _second = connect_device(addr, "D1", "Desk", "desktop").await;

    // The displaced socket is closed by the hub.
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok(), "displaced socket was not closed");
}

#[tokio::test]
async fn unknown_frame_type_gets_error_and_socket_stays_open() {
    let addr = start_hub().await;
    let mut desktop = connect_device(addr, "D1", "Desk", "desktop").await;

    send_frame(&mut desktop, json!({"type": "teleport"})).await;
    let reply = recv_frame(&mut desktop).await;
    assert_eq!(reply["type"], "error");

    send_frame(&mut desktop, json!({"type": "ping"})).await;
    let reply = recv_frame(&mut desktop).await;
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn relay_requires_auth_and_a_room() {
    let addr = start_hub().await;

    // Unauthenticated socket: relay frames are protocol violations.
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    send_frame(
        &mut ws,
        json!({"type": "message", "payload": {"id": "x", "content": "hi", "timestamp": 1, "sessionId": "1"}}),
    )
    .await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Not authenticated");

    // Authenticated but unpaired: still an error, socket stays open.
    let mut desktop = connect_device(addr, "D1", "Desk", "desktop").await;
    send_frame(
        &mut desktop,
        json!({"type": "session_list"}),
    )
    .await;
    let reply = recv_frame(&mut desktop).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Not paired");

    send_frame(&mut desktop, json!({"type": "ping"})).await;
    assert_eq!(recv_frame(&mut desktop).await["type"], "pong");
}

#[tokio::test]
async fn malformed_json_gets_error_frame() {
    let addr = start_hub().await;
    let mut desktop = connect_device(addr, "D1", "Desk", "desktop").await;

    desktop
        .send(Message::Text("{not json at all".into()))
        .await
        .unwrap();
    let reply = recv_frame(&mut desktop).await;
    assert_eq!(reply["type"], "error");

    // The connection survives the bad frame.
    send_frame(&mut desktop, json!({"type": "ping"})).await;
    assert_eq!(recv_frame(&mut desktop).await["type"], "pong");
}

#[tokio::test]
async fn malformed_auth_token_keeps_socket_open_for_retry() {
    let addr = start_hub().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    send_frame(&mut ws, json!({"type": "auth", "token": "only-one-field"})).await;
    assert_eq!(recv_frame(&mut ws).await["type"], "auth_error");

    send_frame(&mut ws, json!({"type": "auth", "token": "D1:Desk:martian"})).await;
    assert_eq!(recv_frame(&mut ws).await["type"], "auth_error");

    // Retry with a good token on the same socket.
    send_frame(&mut ws, json!({"type": "auth", "token": "D1:Desk:desktop"})).await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["deviceId"], "D1");
}

#[tokio::test]
async fn pair_status_reflects_room_membership() {
    let addr = start_hub().await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .get(format!("http://{addr}/api/pair/status?deviceId=D1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["data"]["paired"], false);

    let (_desktop, _phone, pair_id) = paired_peers(addr).await;
    let resp: Value = client
        .get(format!("http://{addr}/api/pair/status?deviceId=D1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["data"]["paired"], true);
    assert_eq!(resp["data"]["pairId"], pair_id.as_str());
}
