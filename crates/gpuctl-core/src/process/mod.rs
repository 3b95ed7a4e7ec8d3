//! ProcessOwner: find, launch, and reliably kill the backend
//! process tree on a known port.
//!
//! Process discovery is inherently racy, so every OS query goes
//! through the [`ProcessInspector`] trait. Production code uses
//! [`SysinfoInspector`]; tests use an in-memory fake.

mod command;
mod inspector;

pub use command::build_command;
pub use inspector::{FakeInspector, ProcessInspector, Signal, SysinfoInspector};

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::config;
use crate::error::{ControllerError, Result};
use crate::recipe::{BackendKind, Recipe};

/// What's running right now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub backend: BackendKind,
    pub model_path: PathBuf,
    pub served_name: String,
    pub port: u16,
}

/// TabbyAPI/ExLlamaV3 doesn't expose a `--port` flag; assume its documented
/// default listen port.
const FALLBACK_DEFAULT_PORT: u16 = 8000;

/// Inspects a full command line and decides which backend family, if any, it
/// belongs to.
pub fn classify_backend(argv: &str) -> Option<BackendKind> {
    if argv.contains("vllm.entrypoints.openai.api_server") {
        return Some(BackendKind::Vllm);
    }
    if argv.contains("vllm") && argv.contains("serve") {
        return Some(BackendKind::Vllm);
    }
    if argv.contains("sglang.launch_server") || argv.contains("sglang_router") {
        return Some(BackendKind::SgLang);
    }
    if argv.contains("tabbyAPI") || (argv.contains("main.py") && argv.contains("--config")) {
        return Some(BackendKind::Fallback);
    }
    None
}

/// Extracts the `--port` value from a command line, if present.
fn extract_port(argv: &[String]) -> Option<u16> {
    for (i, arg) in argv.iter().enumerate() {
        if let Some(v) = arg.strip_prefix("--port=") {
            return v.parse().ok();
        }
        if arg == "--port" {
            return argv.get(i + 1).and_then(|v| v.parse().ok());
        }
    }
    None
}

fn extract_flag_value<'a>(argv: &'a [String], names: &[&str]) -> Option<&'a str> {
    for (i, arg) in argv.iter().enumerate() {
        for name in names {
            if let Some(v) = arg.strip_prefix(&format!("{name}=")) {
                return Some(v);
            }
            if arg == name {
                return argv.get(i + 1).map(|s| s.as_str());
            }
        }
    }
    None
}

/// Extracts `--served-model-name` from a command line.
fn extract_served_name(argv: &[String]) -> Option<String> {
    extract_flag_value(argv, &["--served-model-name"]).map(|s| s.to_string())
}

/// Extracts the model path: `--model` / `--model-path`, or the first
/// non-flag argument after a `serve` subcommand.
fn extract_model_path(argv: &[String]) -> Option<PathBuf> {
    if let Some(v) = extract_flag_value(argv, &["--model", "--model-path"]) {
        return Some(PathBuf::from(v));
    }
    for (i, arg) in argv.iter().enumerate() {
        if arg == "serve" {
            if let Some(next) = argv.get(i + 1) {
                if !next.starts_with("--") {
                    return Some(PathBuf::from(next));
                }
            }
        }
    }
    None
}

pub struct ProcessOwner {
    inspector: Arc<dyn ProcessInspector>,
    log_dir: PathBuf,
    log_prefix: String,
}

impl ProcessOwner {
    pub fn new(inspector: Arc<dyn ProcessInspector>, log_dir: PathBuf, log_prefix: String) -> Self {
        ProcessOwner {
            inspector,
            log_dir,
            log_prefix,
        }
    }

    pub fn with_sysinfo(log_dir: PathBuf, log_prefix: String) -> Self {
        Self::new(Arc::new(SysinfoInspector::default()), log_dir, log_prefix)
    }

    fn log_path(&self, recipe_id: &str) -> PathBuf {
        let sanitized = sanitize_session_id(recipe_id).unwrap_or_else(|| "unknown".to_string());
        self.log_dir
            .join(format!("{}_{}.log", self.log_prefix, sanitized))
    }

    /// Find(port) -> ProcessRecord?.
    pub fn find(&self, port: u16) -> Option<ProcessRecord> {
        for proc in self.inspector.list_processes() {
            let Some(backend) = classify_backend(&proc.argv.join(" ")) else {
                continue;
            };
            let proc_port = extract_port(&proc.argv).unwrap_or_else(|| {
                if backend == BackendKind::Fallback {
                    FALLBACK_DEFAULT_PORT
                } else {
                    0
                }
            });
            if proc_port != port {
                continue;
            }
            let Some(model_path) = extract_model_path(&proc.argv) else {
                continue;
            };
            let served_name = extract_served_name(&proc.argv).unwrap_or_default();
            return Some(ProcessRecord {
                pid: proc.pid,
                backend,
                model_path,
                served_name,
                port,
            });
        }
        None
    }

    /// Spawn(recipe) -> (pid, log_path).
    pub async fn spawn(&self, recipe: &Recipe, port: u16) -> Result<(u32, PathBuf)> {
        std::fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_path(&recipe.id);
        let log_file = std::fs::File::create(&log_path)?;
        let log_file_err = log_file.try_clone()?;

        let built = build_command(recipe, port);
        let mut cmd = tokio::process::Command::new(&built.program);
        cmd.args(&built.args)
            .envs(&built.env)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .stdin(Stdio::null());
        unsafe {
            cmd.pre_exec(|| {
                // New process group so descendants can be killed together.
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ControllerError::Other(anyhow::anyhow!("failed to spawn backend: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| ControllerError::Other(anyhow::anyhow!("spawned process has no pid")))?;

        // After SPAWN_GRACE, check if it already exited.
        let exited = tokio::time::timeout(config::SPAWN_GRACE, child.wait()).await;
        match exited {
            Ok(Ok(status)) => {
                let tail = tail_of_file(&log_path, config::LOG_TAIL_BYTES).await;
                return Err(ControllerError::BackendSpawnFailed {
                    tail: format!("exit status {status}: {tail}"),
                });
            }
            Ok(Err(e)) => {
                return Err(ControllerError::Other(anyhow::anyhow!(
                    "error waiting on spawned backend: {e}"
                )));
            }
            Err(_) => {
                // Still running after the grace period: good, let it run
                // detached. tokio reaps orphaned children in the background.
                drop(child);
            }
        }
        Ok((pid, log_path))
    }

    /// Whether `pid` is still present in the OS process table; used by the
    /// log tailer to know when to stop following a recipe's log file.
    pub fn pid_exists(&self, pid: u32) -> bool {
        self.inspector.pid_exists(pid)
    }

    /// Kill(pid, force). Always reports success (idempotent).
    pub async fn kill(&self, pid: u32, force: bool) -> bool {
        let mut descendants = self.inspector.descendants(pid);
        descendants.push(pid);

        if force {
            for p in &descendants {
                self.inspector.send_signal(*p, Signal::Kill);
            }
            tokio::time::sleep(config::FORCE_KILL_SETTLE).await;
            return true;
        }

        for p in &descendants {
            if *p != pid {
                self.inspector.send_signal(*p, Signal::Term);
            }
        }
        self.inspector.send_signal(pid, Signal::Term);

        let deadline = tokio::time::Instant::now() + config::GRACEFUL_KILL_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if !self.inspector.pid_exists(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if self.inspector.pid_exists(pid) {
            for p in &descendants {
                self.inspector.send_signal(*p, Signal::Kill);
            }
        }
        tokio::time::sleep(config::GRACEFUL_KILL_SETTLE).await;
        true
    }
}

async fn tail_of_file(path: &PathBuf, bytes: usize) -> String {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return String::new();
    };
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).await.is_err() {
        return String::new();
    }
    let start = buf.len().saturating_sub(bytes);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}

/// Synchronous variant for use inside the non-async `tail_fn` closure that
/// [`crate::readiness::ReadinessProbe::wait_ready`] calls on a crash.
pub fn tail_of_file_sync(path: &std::path::Path, bytes: usize) -> String {
    let Ok(buf) = std::fs::read(path) else {
        return String::new();
    };
    let start = buf.len().saturating_sub(bytes);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}

/// Sanitizes a session id for use in a log file name: strip
/// everything but `[A-Za-z0-9._-]`, reject an empty result.
pub fn sanitize_session_id(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

// Helper trait implemented for tokio::process::Command so `pre_exec` compiles
// on unix without pulling in a separate dependency.
trait CommandExt {
    unsafe fn pre_exec<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut() -> std::io::Result<()> + Send + Sync + 'static;
}

impl CommandExt for tokio::process::Command {
    unsafe fn pre_exec<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut() -> std::io::Result<()> + Send + Sync + 'static,
    {
        use std::os::unix::process::CommandExt as _;
        self.as_std_mut().pre_exec(f);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_vllm_module() {
        assert_eq!(
            classify_backend("python -m vllm.entrypoints.openai.api_server --model x"),
            Some(BackendKind::Vllm)
        );
    }

    #[test]
    fn classify_vllm_serve_form() {
        assert_eq!(
            classify_backend("vllm serve Qwen/Qwen2.5-7B --port 8001"),
            Some(BackendKind::Vllm)
        );
    }

    #[test]
    fn classify_sglang() {
        assert_eq!(
            classify_backend("python -m sglang.launch_server --model-path x"),
            Some(BackendKind::SgLang)
        );
    }

    #[test]
    fn classify_unknown_returns_none() {
        assert_eq!(classify_backend("python my_script.py"), None);
    }

    #[test]
    fn classify_tabby_signature() {
        assert_eq!(
            classify_backend("/opt/tabbyAPI/start.sh --model x"),
            Some(BackendKind::Fallback)
        );
    }

    #[test]
    fn classify_main_py_with_config_flag() {
        assert_eq!(
            classify_backend("python3 main.py --config config.yml"),
            Some(BackendKind::Fallback)
        );
    }

    #[test]
    fn port_extraction_space_and_equals_form() {
        let argv: Vec<String> = vec!["--port".into(), "8001".into()];
        assert_eq!(extract_port(&argv), Some(8001));
        let argv: Vec<String> = vec!["--port=8002".into()];
        assert_eq!(extract_port(&argv), Some(8002));
    }

    #[test]
    fn model_path_from_serve_positional() {
        let argv: Vec<String> = vec!["serve".into(), "Qwen/Qwen2.5-7B".into()];
        assert_eq!(
            extract_model_path(&argv),
            Some(PathBuf::from("Qwen/Qwen2.5-7B"))
        );
    }

    #[test]
    fn find_matches_fallback_backend_on_its_default_port() {
        let inspector = Arc::new(FakeInspector::new());
        inspector.add_process(
            77,
            vec![
                "python3".into(),
                "main.py".into(),
                "--config".into(),
                "cfg.yml".into(),
                "--model".into(),
                "/models/x".into(),
            ],
            None,
        );
        let owner = ProcessOwner::new(inspector, PathBuf::from("/tmp"), "backend".to_string());
        let found = owner.find(FALLBACK_DEFAULT_PORT).expect("fallback process found");
        assert_eq!(found.backend, BackendKind::Fallback);
        assert_eq!(found.pid, 77);
    }

    #[test]
    fn sanitize_strips_unsafe_chars() {
        assert_eq!(
            sanitize_session_id("r1/../../etc"),
            Some("r1....etc".to_string())
        );
        assert_eq!(sanitize_session_id("!!!"), None);
        assert_eq!(sanitize_session_id("abc-123_def.log"), Some("abc-123_def.log".to_string()));
    }
}
