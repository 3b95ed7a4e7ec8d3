//! Supervisor — the core state machine. Owns the single
//! backend slot and serializes every operation that may spawn or kill it
//! through `switch_mutex`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::{ControllerError, Result};
use crate::event_bus::{EventBus, LaunchStage};
use crate::log_tailer;
use crate::process::{ProcessOwner, ProcessRecord, tail_of_file_sync};
use crate::readiness::{ReadinessOutcome, ReadinessProbe};
use crate::recipe::Recipe;
use crate::recipes::RecipeSet;

/// Conflict (preemption in progress) is resolved entirely inside
/// `launch` below and is never constructed as a surfaced error.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchResult {
    pub success: bool,
    pub pid: Option<u32>,
    pub message: String,
    pub log_file: Option<PathBuf>,
}

impl LaunchResult {
    fn ok(pid: u32, log_file: PathBuf) -> Self {
        LaunchResult {
            success: true,
            pid: Some(pid),
            message: "ready".to_string(),
            log_file: Some(log_file),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        LaunchResult {
            success: false,
            pid: None,
            message: message.into(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub process: Option<ProcessRecord>,
    pub inference_port: u16,
    pub launching: Option<String>,
}

pub struct Supervisor {
    process_owner: Arc<ProcessOwner>,
    readiness: ReadinessProbe,
    event_bus: Arc<EventBus>,
    recipes: Arc<RecipeSet>,
    inference_port: u16,
    switch_mutex: Mutex<()>,
    launching_recipe_id: RwLock<Option<String>>,
    cancel_signals: Mutex<HashMap<String, CancellationToken>>,
}

impl Supervisor {
    pub fn new(
        process_owner: ProcessOwner,
        readiness: ReadinessProbe,
        event_bus: Arc<EventBus>,
        recipes: Arc<RecipeSet>,
        inference_port: u16,
    ) -> Self {
        Supervisor {
            process_owner: Arc::new(process_owner),
            readiness,
            event_bus,
            recipes,
            inference_port,
            switch_mutex: Mutex::new(()),
            launching_recipe_id: RwLock::new(None),
            cancel_signals: Mutex::new(HashMap::new()),
        }
    }

    pub async fn status(&self) -> StatusSnapshot {
        let process = self.process_owner.find(self.inference_port);
        StatusSnapshot {
            running: process.is_some(),
            process,
            inference_port: self.inference_port,
            launching: self.launching_recipe_id.read().await.clone(),
        }
    }

    fn find_recipe(&self, recipe_id: &str) -> Result<Recipe> {
        self.recipes
            .get(recipe_id)
            .or_else(|| self.recipes.find_matching(recipe_id))
            .ok_or_else(|| ControllerError::NotFound(recipe_id.to_string()))
    }

    /// Launch(recipe_id, force) — the full eight-step
    /// protocol, including preemption of any in-flight launch for a
    /// different recipe.
    pub async fn launch(&self, recipe_id: &str, force: bool) -> Result<LaunchResult> {
        let recipe = self.find_recipe(recipe_id)?;

        // 1. Preempt check.
        let victim = self.launching_recipe_id.read().await.clone();
        if let Some(victim_id) = victim {
            if victim_id != recipe.id {
                self.event_bus.publish_launch_progress(
                    &recipe.id,
                    LaunchStage::Preempting,
                    "preempting in-flight launch",
                    0.0,
                );
                self.event_bus.publish_launch_progress(
                    &victim_id,
                    LaunchStage::Cancelled,
                    "preempted by a newer launch",
                    0.0,
                );
                if let Some(token) = self.cancel_signals.lock().await.get(&victim_id) {
                    token.cancel();
                }
                if let Some(rec) = self.process_owner.find(self.inference_port) {
                    self.process_owner.kill(rec.pid, true).await;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        // 2. Register.
        let cancel = CancellationToken::new();
        self.cancel_signals
            .lock()
            .await
            .insert(recipe.id.clone(), cancel.clone());
        *self.launching_recipe_id.write().await = Some(recipe.id.clone());

        let result = self.launch_locked(&recipe, force, &cancel).await;

        // 8. Cleanup.
        {
            let mut guard = self.launching_recipe_id.write().await;
            if guard.as_deref() == Some(recipe.id.as_str()) {
                *guard = None;
            }
        }
        self.cancel_signals.lock().await.remove(&recipe.id);

        result
    }

    /// Steps 3-7: acquire `switch_mutex`, evict, spawn, wait.
    async fn launch_locked(
        &self,
        recipe: &Recipe,
        _force: bool,
        cancel: &CancellationToken,
    ) -> Result<LaunchResult> {
        // 3. Acquire switch_mutex with a 2s deadline; escalate to force-kill
        // the stale holder and then acquire unconditionally.
        let _permit = match tokio::time::timeout(
            config::MUTEX_ACQUIRE_DEADLINE,
            self.switch_mutex.lock(),
        )
        .await
        {
            Ok(permit) => permit,
            Err(_) => {
                if let Some(rec) = self.process_owner.find(self.inference_port) {
                    self.process_owner.kill(rec.pid, true).await;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.switch_mutex.lock().await
            }
        };

        // 4. Evict.
        self.event_bus.publish_launch_progress(
            &recipe.id,
            LaunchStage::Evicting,
            "stopping current backend",
            0.0,
        );
        if let Some(rec) = self.process_owner.find(self.inference_port) {
            self.process_owner.kill(rec.pid, true).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        if cancel.is_cancelled() {
            self.event_bus.publish_launch_progress(
                &recipe.id,
                LaunchStage::Cancelled,
                "cancelled during eviction",
                0.0,
            );
            return Ok(LaunchResult::failure("cancelled"));
        }

        // 5. Spawn.
        self.event_bus.publish_launch_progress(
            &recipe.id,
            LaunchStage::Launching,
            "starting backend",
            0.25,
        );
        let (pid, log_path) = match self.process_owner.spawn(recipe, self.inference_port).await {
            Ok(v) => v,
            Err(e) => {
                self.event_bus
                    .publish_launch_progress(&recipe.id, LaunchStage::Error, &e.to_string(), 0.25);
                return Err(e);
            }
        };
        log_tailer::spawn(
            self.event_bus.clone(),
            self.process_owner.clone(),
            recipe.id.clone(),
            log_path.clone(),
            pid,
        );

        // 6 & 7. Wait.
        self.event_bus.publish_launch_progress(
            &recipe.id,
            LaunchStage::Waiting,
            "waiting for readiness",
            0.5,
        );
        let timeout = config::READINESS_TIMEOUT;
        let log_path_for_tail = log_path.clone();
        let recipe_id = recipe.id.clone();
        let bus = self.event_bus.clone();
        let outcome = self
            .readiness
            .wait_ready(
                pid,
                self.inference_port,
                timeout,
                config::LAUNCH_TICK,
                cancel,
                move || tail_of_file_sync(&log_path_for_tail, config::LOG_TAIL_BYTES),
                move |tick| {
                    let crate::readiness::Tick::Waiting { elapsed_secs } = tick;
                    let progress = 0.5 + (elapsed_secs as f32 / timeout.as_secs() as f32) * 0.5;
                    bus.publish_launch_progress(
                        &recipe_id,
                        LaunchStage::Waiting,
                        &format!("Loading model... ({elapsed_secs}s)"),
                        progress,
                    );
                },
            )
            .await;

        match outcome {
            ReadinessOutcome::Ready => {
                self.event_bus
                    .publish_launch_progress(&recipe.id, LaunchStage::Ready, "ready", 1.0);
                Ok(LaunchResult::ok(pid, log_path))
            }
            ReadinessOutcome::Cancelled => {
                self.process_owner.kill(pid, true).await;
                self.event_bus.publish_launch_progress(
                    &recipe.id,
                    LaunchStage::Cancelled,
                    "cancelled while waiting for readiness",
                    0.5,
                );
                Ok(LaunchResult::failure("cancelled"))
            }
            ReadinessOutcome::Crashed { log_tail } => {
                self.event_bus.publish_launch_progress(
                    &recipe.id,
                    LaunchStage::Error,
                    &format!("backend crashed: {log_tail}"),
                    0.5,
                );
                Err(ControllerError::BackendCrashed { tail: log_tail })
            }
            ReadinessOutcome::Timeout => {
                self.process_owner.kill(pid, true).await;
                self.event_bus.publish_launch_progress(
                    &recipe.id,
                    LaunchStage::Error,
                    "timeout",
                    0.5,
                );
                Err(ControllerError::BackendReadinessTimeout {
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Evict(force).
    pub async fn evict(&self, force: bool) -> Option<u32> {
        let _permit = self.switch_mutex.lock().await;
        let record = self.process_owner.find(self.inference_port)?;
        self.process_owner.kill(record.pid, force).await;
        Some(record.pid)
    }

    /// EnsureRunning(model_name): the silent auto-switch path
    /// used by ChatProxy. Issues no SSE progress, omits preemption of
    /// itself, and uses graceful eviction with a wider poll tick.
    pub async fn ensure_running(&self, model_name: &str) -> Result<()> {
        let recipe = self
            .recipes
            .find_matching(model_name)
            .ok_or_else(|| ControllerError::NotFound(model_name.to_string()))?;

        if let Some(current) = self.process_owner.find(self.inference_port) {
            if recipe.matches(&current.served_name) {
                return Ok(());
            }
        }

        let _permit = self.switch_mutex.lock().await;
        // Re-check: another EnsureRunning/Launch may have already switched
        // while we waited for the mutex.
        if let Some(current) = self.process_owner.find(self.inference_port) {
            if recipe.matches(&current.served_name) {
                return Ok(());
            }
            self.process_owner.kill(current.pid, false).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let (pid, log_path) = self.process_owner.spawn(&recipe, self.inference_port).await?;
        log_tailer::spawn(
            self.event_bus.clone(),
            self.process_owner.clone(),
            recipe.id.clone(),
            log_path.clone(),
            pid,
        );
        let cancel = CancellationToken::new();
        let outcome = self
            .readiness
            .wait_ready(
                pid,
                self.inference_port,
                config::READINESS_TIMEOUT,
                config::ENSURE_RUNNING_TICK,
                &cancel,
                move || tail_of_file_sync(&log_path, config::LOG_TAIL_BYTES),
                |_| {},
            )
            .await;

        match outcome {
            ReadinessOutcome::Ready => Ok(()),
            ReadinessOutcome::Crashed { log_tail } => {
                Err(ControllerError::BackendCrashed { tail: log_tail })
            }
            ReadinessOutcome::Timeout => {
                self.process_owner.kill(pid, true).await;
                Err(ControllerError::BackendReadinessTimeout {
                    secs: config::READINESS_TIMEOUT.as_secs(),
                })
            }
            ReadinessOutcome::Cancelled => Err(ControllerError::Cancelled),
        }
    }
}
