//! Bridge tests: the operator auth gate and the FIFO busy queue, driven the
//! way a chat front-end would drive them.

mod common;

use std::time::Duration;

use tokio::sync::mpsc;

use tether_agent::config::BridgeConfig;
use tether_agent::sessions::worker::WorkerConfig;
use tether_agent::{Bridge, DirScope, SessionMux};

struct Fixture {
    _root: tempfile::TempDir,
    bridge: Bridge,
    out: mpsc::UnboundedReceiver<String>,
    project: std::path::PathBuf,
}

/// Bridge over a fake CLI. `reply_delay_secs` throttles turns so the busy
/// queue fills up.
fn fixture(password: &str, reply_delay_secs: &str) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let project = root.path().join("proj");
    std::fs::create_dir_all(&project).unwrap();
    let cli = common::echoing_cli(root.path(), reply_delay_secs);

    let scope = DirScope::new(&[root.path().to_string_lossy().into_owned()]);
    let mux = SessionMux::new(
        scope,
        WorkerConfig {
            cli_path: cli.to_string_lossy().into_owned(),
            restart_delay: Duration::from_secs(1),
            allowed_tools: Vec::new(),
        },
        10,
    );

    let (out_tx, out) = mpsc::unbounded_channel();
    let bridge = Bridge::new(
        mux,
        &BridgeConfig {
            password: password.to_string(),
            chunk_limit: 4000,
            html_markup: false,
        },
        out_tx,
    );
    Fixture {
        _root: root,
        bridge,
        out,
        project,
    }
}

async fn next_out(out: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(10), out.recv())
        .await
        .expect("timed out waiting for bridge output")
        .expect("bridge output channel closed")
}

#[tokio::test]
async fn auth_gate_prompts_then_admits() {
    let mut fx = fixture("hunter2", "0");

    // First contact: prompt, nothing else happens.
    fx.bridge.handle_operator_line("op", "hello there").await;
    assert_eq!(next_out(&mut fx.out).await, "🔐 please enter password");

    // Commands are not password attempts.
    fx.bridge.handle_operator_line("op", "/list").await;
    assert_eq!(next_out(&mut fx.out).await, "please authenticate first");

    // Wrong password: prompt again.
    fx.bridge.handle_operator_line("op", "hunter3").await;
    assert_eq!(next_out(&mut fx.out).await, "🔐 please enter password");

    // Right password: admitted, and commands now work.
    fx.bridge.handle_operator_line("op", "hunter2").await;
    assert_eq!(next_out(&mut fx.out).await, "authenticated");

    fx.bridge.handle_operator_line("op", "/status").await;
    let status = next_out(&mut fx.out).await;
    assert!(status.contains("sessions: 0"), "{status}");
}

#[tokio::test]
async fn empty_password_disables_the_gate() {
    let mut fx = fixture("", "0");
    fx.bridge.handle_operator_line("op", "/status").await;
    let status = next_out(&mut fx.out).await;
    assert!(status.contains("sessions: 0"), "{status}");
}

#[tokio::test]
async fn busy_messages_queue_fifo_and_drain_on_done() {
    let mut fx = fixture("", "0.3");
    let project = fx.project.to_string_lossy().into_owned();

    fx.bridge
        .handle_operator_line("op", &format!("/new proj {project}"))
        .await;
    let created = next_out(&mut fx.out).await;
    assert!(created.contains("created"), "{created}");

    // m1 enters the session; m2 and m3 land in the queue in order.
    fx.bridge.handle_operator_line("op", "m1").await;
    fx.bridge.handle_operator_line("op", "m2").await;
    assert_eq!(next_out(&mut fx.out).await, "queued (position 1)");
    fx.bridge.handle_operator_line("op", "m3").await;
    assert_eq!(next_out(&mut fx.out).await, "queued (position 2)");

    // Three responses arrive, one per turn: the queue drained serially.
    for _ in 0..3 {
        let reply = next_out(&mut fx.out).await;
        assert_eq!(reply, "[proj] echo reply");
    }

    // Queue is empty again; a fresh message goes straight through.
    fx.bridge.handle_operator_line("op", "m4").await;
    let reply = next_out(&mut fx.out).await;
    assert_eq!(reply, "[proj] echo reply");
}

#[tokio::test]
async fn stop_clears_the_queue() {
    let mut fx = fixture("", "0.5");
    let project = fx.project.to_string_lossy().into_owned();

    fx.bridge
        .handle_operator_line("op", &format!("/new proj {project}"))
        .await;
    let _ = next_out(&mut fx.out).await;

    fx.bridge.handle_operator_line("op", "m1").await;
    fx.bridge.handle_operator_line("op", "m2").await;
    assert_eq!(next_out(&mut fx.out).await, "queued (position 1)");

    fx.bridge.handle_operator_line("op", "/stop").await;
    let stopped = next_out(&mut fx.out).await;
    assert!(stopped.contains("1 queued message(s) dropped"), "{stopped}");
}

#[tokio::test]
async fn session_command_reports_usage() {
    let mut fx = fixture("", "0");
    let project = fx.project.to_string_lossy().into_owned();

    fx.bridge
        .handle_operator_line("op", &format!("/new proj {project}"))
        .await;
    let _ = next_out(&mut fx.out).await;

    fx.bridge.handle_operator_line("op", "hello").await;
    let reply = next_out(&mut fx.out).await;
    assert_eq!(reply, "[proj] echo reply");

    fx.bridge.handle_operator_line("op", "/session").await;
    let usage = next_out(&mut fx.out).await;
    assert!(usage.contains("model: fake-model"), "{usage}");
    assert!(usage.contains("messages: 1"), "{usage}");
}

#[tokio::test]
async fn switch_drops_the_stale_queue() {
    let mut fx = fixture("", "0.5");
    let project = fx.project.to_string_lossy().into_owned();

    fx.bridge
        .handle_operator_line("op", &format!("/new one {project}"))
        .await;
    let _ = next_out(&mut fx.out).await;
    fx.bridge
        .handle_operator_line("op", &format!("/new two {project}"))
        .await;
    let _ = next_out(&mut fx.out).await;

    // Busy the active session (one) and back up a message behind it.
    fx.bridge.handle_operator_line("op", "m1").await;
    fx.bridge.handle_operator_line("op", "m2").await;
    assert_eq!(next_out(&mut fx.out).await, "queued (position 1)");

    // Queued text was meant for session one; it must not follow us to two.
    fx.bridge.handle_operator_line("op", "/switch two").await;
    let switched = next_out(&mut fx.out).await;
    assert!(switched.contains("switched to session 2"), "{switched}");
    assert!(switched.contains("1 queued message(s) dropped"), "{switched}");

    // Session one finishes m1; the only reply is m1's, nothing drained.
    let reply = next_out(&mut fx.out).await;
    assert_eq!(reply, "[one] echo reply");
    fx.bridge.handle_operator_line("op", "/status").await;
    let status = next_out(&mut fx.out).await;
    assert!(status.contains("queued messages: 0"), "{status}");
}

#[tokio::test]
async fn html_markup_escapes_each_chunk_after_splitting() {
    let root = tempfile::tempdir().unwrap();
    let cli = common::echoing_cli(root.path(), "0");
    let scope = DirScope::new(&[root.path().to_string_lossy().into_owned()]);
    let mux = SessionMux::new(
        scope,
        WorkerConfig {
            cli_path: cli.to_string_lossy().into_owned(),
            restart_delay: Duration::from_secs(1),
            allowed_tools: Vec::new(),
        },
        10,
    );

    let (out_tx, mut out) = mpsc::unbounded_channel();
    let bridge = Bridge::new(
        mux,
        &BridgeConfig {
            password: String::new(),
            chunk_limit: 4000,
            html_markup: true,
        },
        out_tx,
    );

    // The command echo carries markup-significant characters.
    bridge.handle_operator_line("op", "/teleport<&>").await;
    let reply = next_out(&mut out).await;
    assert!(reply.contains("&lt;&amp;&gt;"), "{reply}");
    assert!(!reply.contains('<'), "{reply}");
}

#[tokio::test]
async fn unknown_command_points_to_help() {
    let mut fx = fixture("", "0");
    fx.bridge.handle_operator_line("op", "/teleport").await;
    let reply = next_out(&mut fx.out).await;
    assert!(reply.contains("Unknown command"), "{reply}");

    fx.bridge.handle_operator_line("op", "/start").await;
    let help = next_out(&mut fx.out).await;
    assert!(help.contains("/new"), "{help}");
}
