//! ReadinessProbe: poll the backend's `/health`, detect
//! crash via process existence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config;
use crate::process::ProcessInspector;

#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessOutcome {
    Ready,
    Crashed { log_tail: String },
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Waiting { elapsed_secs: u64 },
}

pub struct ReadinessProbe {
    inspector: Arc<dyn ProcessInspector>,
    http: reqwest::Client,
}

impl ReadinessProbe {
    pub fn new(inspector: Arc<dyn ProcessInspector>) -> Self {
        ReadinessProbe {
            inspector,
            http: reqwest::Client::builder()
                .timeout(config::HEALTH_POLL_TIMEOUT)
                .build()
                .expect("building reqwest client"),
        }
    }

    async fn health_check(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/health");
        match self.http.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// WaitReady(pid, port, timeout, on_tick).
    ///
    /// `poll_interval` lets callers choose 2-3s (explicit launch) or a wider
    /// interval (auto-switch's `EnsureRunning`). `cancel` is
    /// checked at the top of every tick and interrupts
    /// the sleep so a preemption is observed promptly rather than at the next
    /// whole poll interval.
    pub async fn wait_ready<F>(
        &self,
        pid: u32,
        port: u16,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
        tail_fn: impl Fn() -> String,
        mut on_tick: F,
    ) -> ReadinessOutcome
    where
        F: FnMut(Tick),
    {
        let start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return ReadinessOutcome::Cancelled;
            }
            if !self.inspector.pid_exists(pid) {
                return ReadinessOutcome::Crashed {
                    log_tail: tail_fn(),
                };
            }
            if self.health_check(port).await {
                return ReadinessOutcome::Ready;
            }
            if start.elapsed() >= timeout {
                return ReadinessOutcome::Timeout;
            }
            on_tick(Tick::Waiting {
                elapsed_secs: start.elapsed().as_secs(),
            });
            let remaining = poll_interval.min(timeout.saturating_sub(start.elapsed()).max(Duration::from_millis(1)));
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::FakeInspector;

    #[tokio::test]
    async fn crash_detected_when_pid_disappears() {
        let fake = Arc::new(FakeInspector::new());
        // pid never registered => "doesn't exist"
        let probe = ReadinessProbe::new(fake);
        let cancel = CancellationToken::new();
        let outcome = probe
            .wait_ready(
                12345,
                1,
                Duration::from_millis(50),
                Duration::from_millis(5),
                &cancel,
                || "log tail".to_string(),
                |_| {},
            )
            .await;
        assert_eq!(
            outcome,
            ReadinessOutcome::Crashed {
                log_tail: "log tail".to_string()
            }
        );
    }

    #[tokio::test]
    async fn timeout_when_alive_but_never_healthy() {
        let fake = Arc::new(FakeInspector::new());
        fake.add_process(999, vec!["fake".into()], None);
        let probe = ReadinessProbe::new(fake);
        let cancel = CancellationToken::new();
        let outcome = probe
            .wait_ready(
                999,
                65535, // nothing listens here
                Duration::from_millis(30),
                Duration::from_millis(10),
                &cancel,
                || String::new(),
                |_| {},
            )
            .await;
        assert_eq!(outcome, ReadinessOutcome::Timeout);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let fake = Arc::new(FakeInspector::new());
        fake.add_process(1000, vec!["fake".into()], None);
        let probe = ReadinessProbe::new(fake);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });
        let outcome = probe
            .wait_ready(
                1000,
                65535,
                Duration::from_secs(5),
                Duration::from_secs(5),
                &cancel,
                || String::new(),
                |_| {},
            )
            .await;
        assert_eq!(outcome, ReadinessOutcome::Cancelled);
    }
}
