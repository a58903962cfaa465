//! Built-in supervisor that restarts the hub on crash.
//!
//! `tether-hub supervise` forks `tether-hub serve` and monitors it. Health
//! is judged by the hub's own contract rather than wall-clock uptime: the
//! supervisor periodically tries a TCP connect against the configured
//! listen address, and only once the child actually accepts a connection is
//! the restart backoff reset. A hub that binds and immediately dies keeps
//! backing off instead of crash-looping at full speed.
//!
//! SIGINT/SIGTERM are forwarded to the child; once a forwarded signal
//! brings the child down, the supervisor stops instead of restarting it.
//! A clean exit (code 0) also stops the supervisor.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;

/// Rewrite a wildcard bind address into one the probe can connect to.
fn probe_addr(listen: &str) -> String {
    match listen.strip_prefix("0.0.0.0:") {
        Some(port) => format!("127.0.0.1:{port}"),
        None => listen.to_string(),
    }
}

fn forward_signal(pid: Option<u32>, sig: i32) {
    if let Some(pid) = pid {
        info!("Supervisor: forwarding signal {sig} to hub (pid {pid})");
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::kill(pid as i32, sig);
        }
    }
}

/// Run the supervisor loop. Does not return unless the hub exits cleanly or
/// the supervisor itself is asked to shut down.
pub async fn run_supervisor(config_path: Option<&str>, config: &Config) -> ! {
    let mut backoff = 1u64;
    let max_backoff = config.supervisor.max_backoff;
    let probe_interval = Duration::from_secs(config.supervisor.probe_interval_secs);
    let addr = probe_addr(&config.server.listen);

    let exe = std::env::current_exe().expect("resolve own executable path");
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("register SIGINT");
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("register SIGTERM");

    loop {
        let mut cmd = Command::new(&exe);
        cmd.arg("serve");
        if let Some(p) = config_path {
            cmd.args(["--config", p]);
        }
        let mut child = cmd.spawn().expect("failed to spawn hub process");
        let pid = child.id();
        info!("Supervisor: started hub (pid {pid:?}), probing {addr}");

        let mut accepting = false;
        let mut shutdown = false;
        let mut probe = tokio::time::interval(probe_interval);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = probe.tick() => {
                    if !accepting && TcpStream::connect(&addr).await.is_ok() {
                        info!("Supervisor: hub is accepting connections on {addr}");
                        accepting = true;
                        backoff = 1;
                    }
                }
                _ = sigint.recv() => {
                    shutdown = true;
                    forward_signal(pid, libc::SIGINT);
                }
                _ = sigterm.recv() => {
                    shutdown = true;
                    forward_signal(pid, libc::SIGTERM);
                }
            }
        };

        match status {
            Ok(s) if s.success() => {
                info!("Hub exited cleanly, supervisor stopping");
                std::process::exit(0);
            }
            Ok(s) if shutdown => {
                info!("Hub stopped after forwarded signal ({s}), supervisor stopping");
                std::process::exit(0);
            }
            Ok(s) => warn!("Hub exited: {s}, restarting in {backoff}s"),
            Err(e) => warn!("Hub wait error: {e}, restarting in {backoff}s"),
        }

        // Backoff widens only while the hub has never answered the probe.
        if !accepting {
            backoff = (backoff * 2).min(max_backoff);
        }
        tokio::time::sleep(Duration::from_secs(backoff)).await;
    }
}
