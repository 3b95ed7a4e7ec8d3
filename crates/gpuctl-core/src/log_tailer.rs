//! Follows a running backend's log file and republishes each completed
//! line onto the `logs:<session_id>` event-bus channel, so
//! `/logs/{session_id}/stream` has something to serve. Stops on its own once
//! the backend pid it was started for no longer exists.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use crate::config;
use crate::event_bus::EventBus;
use crate::process::ProcessOwner;

/// Spawns a background task that tails `log_path`, publishing each new line
/// to `logs:<session_id>` until `pid` exits. The task owns no handle the
/// caller must join: it is self-terminating and best-effort, matching the
/// rest of the telemetry surface (a tailer that falls behind or errors out
/// just stops, it never blocks a launch).
pub fn spawn(
    event_bus: Arc<EventBus>,
    process_owner: Arc<ProcessOwner>,
    session_id: String,
    log_path: PathBuf,
    pid: u32,
) {
    tokio::spawn(async move {
        if let Err(e) = run(&event_bus, &process_owner, &session_id, &log_path, pid).await {
            tracing::warn!(error = %e, %session_id, "log tailer exited early");
        }
    });
}

async fn run(
    event_bus: &EventBus,
    process_owner: &ProcessOwner,
    session_id: &str,
    log_path: &PathBuf,
    pid: u32,
) -> std::io::Result<()> {
    // The file may not exist yet for an instant after spawn(); wait for it
    // rather than giving up.
    let mut file = loop {
        match tokio::fs::File::open(log_path).await {
            Ok(f) => break f,
            Err(_) if process_owner.pid_exists(pid) => {
                tokio::time::sleep(config::LOG_TAIL_POLL_INTERVAL).await;
                continue;
            }
            Err(e) => return Err(e),
        }
    };

    // Only complete lines are published: a write split across two polls must
    // not be reported as two separate half-lines, so unterminated bytes stay
    // in `carry` until the next read completes them.
    let mut carry = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            if !process_owner.pid_exists(pid) {
                return Ok(());
            }
            tokio::time::sleep(config::LOG_TAIL_POLL_INTERVAL).await;
            continue;
        }
        carry.extend_from_slice(&chunk[..n]);
        while let Some(nl) = carry.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = carry.drain(..=nl).collect();
            let text = String::from_utf8_lossy(&line_bytes);
            let text = text.trim_end_matches(['\n', '\r']);
            if !text.is_empty() {
                event_bus.publish_log_line(session_id, text);
            }
        }
    }
}
