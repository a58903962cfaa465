#![allow(dead_code)] // each test binary uses a different subset of the harness

//! Shared fake-CLI harness for agent integration tests.
//!
//! The fake is a shell script that speaks just enough of the CLI's
//! stream-json stdout protocol: an `init` system line on startup, then one
//! canned `assistant` + `result` pair per stdin line.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A fake CLI that answers every user line with one text block and a result.
/// `reply_delay_secs` (e.g. "0.3") holds the turn open so busy-lock paths can
/// be exercised; "0" answers immediately.
pub fn echoing_cli(dir: &Path, reply_delay_secs: &str) -> PathBuf {
    let body = format!(
        r#"#!/bin/sh
echo '{{"type":"system","subtype":"init","session_id":"fake-session","model":"fake-model"}}'
while IFS= read -r line; do
  sleep {reply_delay_secs}
  echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"echo reply"}}]}}}}'
  echo '{{"type":"result","total_cost_usd":0.01,"usage":{{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":2,"cache_creation_input_tokens":1}}}}'
done
"#
    );
    write_script(dir, "fake-claude", &body)
}

/// A fake CLI that prints a partial answer for the first user line and then
/// dies without ever sending `result`.
pub fn crashing_cli(dir: &Path) -> PathBuf {
    let body = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"fake-session","model":"fake-model"}'
IFS= read -r line
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"partial answer"}]}}'
exit 1
"#;
    write_script(dir, "fake-claude-crash", body)
}

/// A fake CLI that exits as soon as it has announced itself.
pub fn exiting_cli(dir: &Path) -> PathBuf {
    let body = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"fake-session","model":"fake-model"}'
exit 3
"#;
    write_script(dir, "fake-claude-exit", body)
}
