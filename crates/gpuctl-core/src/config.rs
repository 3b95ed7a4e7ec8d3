//! Ambient configuration and the timeout constants shared across the crate.

use std::path::PathBuf;
use std::time::Duration;

/// Backend readiness timeout.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(300);
/// Per-`/health` poll timeout.
pub const HEALTH_POLL_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-`/metrics` scrape timeout.
pub const METRICS_SCRAPE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upstream chat-completions request timeout.
pub const UPSTREAM_CHAT_TIMEOUT: Duration = Duration::from_secs(300);
/// Bound on a subscriber's SSE queue before events are dropped for it.
pub const SSE_QUEUE_CAP: usize = 100;
/// How long `Supervisor::launch` waits to acquire `switch_mutex` before
/// force-killing the stale holder.
pub const MUTEX_ACQUIRE_DEADLINE: Duration = Duration::from_secs(2);
/// Sleep after a force-kill to let the OS reap descendants.
pub const FORCE_KILL_SETTLE: Duration = Duration::from_millis(500);
/// Sleep after a graceful kill to let the OS reap descendants.
pub const GRACEFUL_KILL_SETTLE: Duration = Duration::from_secs(1);
/// Graceful kill escalation timeout.
pub const GRACEFUL_KILL_TIMEOUT: Duration = Duration::from_secs(10);
/// Tick interval used by `Supervisor::ensure_running`'s readiness poll.
pub const ENSURE_RUNNING_TICK: Duration = Duration::from_secs(3);
/// Tick interval used by the explicit-launch readiness poll.
pub const LAUNCH_TICK: Duration = Duration::from_secs(2);
/// Grace period allowed for a spawned process to prove it didn't die instantly.
pub const SPAWN_GRACE: Duration = Duration::from_secs(3);
/// How many trailing bytes of a crash log to include in error messages.
pub const LOG_TAIL_BYTES: usize = 500;
/// Bound used by property test 5 (preemption liveness).
pub const PREEMPT_BOUND: Duration = Duration::from_secs(10);
/// Poll interval for the per-recipe log tailer that feeds `logs:<session_id>`.
pub const LOG_TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Metrics tick defaults to 1 second, but stays a runtime value so tests can
/// parameterize it.
pub const DEFAULT_METRICS_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// The port the GPU backend process listens on.
    pub inference_port: u16,
    pub upstream_base_url: String,
    pub upstream_token: Option<String>,
    pub log_dir: PathBuf,
    pub recipe_dir: PathBuf,
    pub lifetime_db_path: PathBuf,
    pub metrics_tick: Duration,
    pub log_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 8000,
            inference_port: 8001,
            upstream_base_url: "http://127.0.0.1:8001".to_string(),
            upstream_token: None,
            log_dir: PathBuf::from("/tmp/gpuctl/logs"),
            recipe_dir: PathBuf::from("/etc/gpuctl/recipes"),
            lifetime_db_path: PathBuf::from("/tmp/gpuctl/lifetime.db"),
            metrics_tick: DEFAULT_METRICS_TICK,
            log_prefix: "backend".to_string(),
        }
    }
}
