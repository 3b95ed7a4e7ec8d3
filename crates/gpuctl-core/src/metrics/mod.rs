//! MetricsCollector: a single background tick loop that
//! reads GPU telemetry, scrapes the backend's `/metrics`, and folds
//! everything into lifetime counters. Best-effort: any failure inside a
//! tick is logged and the loop continues.

pub mod gpu;
mod prom;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config;
use crate::event_bus::EventBus;
use crate::lifetime_store::LifetimeStore;
use crate::process::ProcessOwner;
use gpu::GpuSnapshot;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PeakRecord {
    peak_generation_throughput: f64,
    peak_prompt_throughput: f64,
    peak_gpu_utilization_percent: f64,
}

#[derive(Debug, Clone, Default)]
struct CounterDeltas {
    prev_generation_tokens: Option<f64>,
    prev_prompt_tokens: Option<f64>,
    prev_request_success: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub num_requests_running: Option<f64>,
    pub num_requests_waiting: Option<f64>,
    pub kv_cache_usage_perc: Option<f64>,
    pub avg_generation_throughput: Option<f64>,
    pub avg_prompt_throughput: Option<f64>,
    pub time_to_first_token_avg: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub peak_generation_throughput: f64,
    pub peak_prompt_throughput: f64,
    pub peak_gpu_utilization_percent: f64,
    pub energy_kwh: f64,
    pub uptime_hours: f64,
    pub kwh_per_million_tokens: Option<f64>,
    pub current_power_watts: f64,
}

pub struct MetricsCollector {
    process_owner: ProcessOwner,
    event_bus: std::sync::Arc<EventBus>,
    lifetime: std::sync::Arc<LifetimeStore>,
    gpu_source: Box<dyn gpu::GpuSource>,
    http: reqwest::Client,
    inference_port: u16,
    tick: Duration,
    deltas: Mutex<CounterDeltas>,
    peaks: Mutex<HashMap<String, PeakRecord>>,
}

impl MetricsCollector {
    pub fn new(
        process_owner: ProcessOwner,
        event_bus: std::sync::Arc<EventBus>,
        lifetime: std::sync::Arc<LifetimeStore>,
        inference_port: u16,
        tick: Duration,
    ) -> Self {
        MetricsCollector {
            process_owner,
            event_bus,
            lifetime,
            gpu_source: gpu::detect_source(),
            http: reqwest::Client::builder()
                .timeout(config::METRICS_SCRAPE_TIMEOUT)
                .build()
                .expect("building reqwest client"),
            inference_port,
            tick,
            deltas: Mutex::new(CounterDeltas::default()),
            peaks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the tick loop forever; intended to be spawned on its own task
    /// and aborted (or raced against a shutdown signal) by the caller.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            interval.tick().await;
            self.run_once().await;
        }
    }

    async fn run_once(&self) {
        let record = self.process_owner.find(self.inference_port);

        self.event_bus.publish_status(serde_json::json!({
            "running": record.is_some(),
            "process": record,
            "inference_port": self.inference_port,
        }));

        let gpus: Vec<GpuSnapshot> = self.gpu_source.read();
        self.event_bus
            .publish_gpu(serde_json::json!({ "gpus": gpus }));

        let tick_secs = self.tick.as_secs_f64();
        let total_power: f64 = gpus
            .iter()
            .filter_map(|g| g.power_draw_watts)
            .map(|w| w as f64)
            .sum();
        let energy_wh_delta = total_power * tick_secs / 3600.0;
        let energy_wh = match self.lifetime.increment("energy_wh", energy_wh_delta) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist energy_wh");
                0.0
            }
        };

        let mut snapshot = MetricsSnapshot {
            num_requests_running: None,
            num_requests_waiting: None,
            kv_cache_usage_perc: None,
            avg_generation_throughput: None,
            avg_prompt_throughput: None,
            time_to_first_token_avg: None,
            tokens_per_second: None,
            peak_generation_throughput: 0.0,
            peak_prompt_throughput: 0.0,
            peak_gpu_utilization_percent: 0.0,
            energy_kwh: energy_wh / 1000.0,
            uptime_hours: 0.0,
            kwh_per_million_tokens: None,
            current_power_watts: total_power,
        };

        if let Some(record) = &record {
            let uptime_seconds = match self
                .lifetime
                .increment("uptime_seconds", tick_secs)
            {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to persist uptime_seconds");
                    0.0
                }
            };
            snapshot.uptime_hours = uptime_seconds / 3600.0;

            if let Err(e) = self.scrape_backend(record.port, &mut snapshot).await {
                tracing::warn!(error = %e, "backend /metrics scrape failed; skipping this tick");
            } else {
                let mut peaks = self.peaks.lock().unwrap();
                let peak = peaks.entry(record.served_name.clone()).or_default();
                if let Some(v) = snapshot.avg_generation_throughput {
                    peak.peak_generation_throughput = peak.peak_generation_throughput.max(v);
                }
                if let Some(v) = snapshot.avg_prompt_throughput {
                    peak.peak_prompt_throughput = peak.peak_prompt_throughput.max(v);
                }
                let gpu_util_max = gpus
                    .iter()
                    .filter_map(|g| g.utilization_percent)
                    .fold(0.0_f32, f32::max) as f64;
                peak.peak_gpu_utilization_percent = peak.peak_gpu_utilization_percent.max(gpu_util_max);
                snapshot.peak_generation_throughput = peak.peak_generation_throughput;
                snapshot.peak_prompt_throughput = peak.peak_prompt_throughput;
                snapshot.peak_gpu_utilization_percent = peak.peak_gpu_utilization_percent;
            }
        }

        if let Some(tokens_total) = self.lifetime.get("tokens_total").ok().flatten() {
            if tokens_total > 0.0 {
                snapshot.kwh_per_million_tokens = Some(snapshot.energy_kwh / (tokens_total / 1_000_000.0));
            }
        }

        self.event_bus
            .publish_metrics(serde_json::to_value(&snapshot).unwrap_or_default());
    }

    async fn scrape_backend(
        &self,
        port: u16,
        snapshot: &mut MetricsSnapshot,
    ) -> anyhow::Result<()> {
        let url = format!("http://127.0.0.1:{port}/metrics");
        let text = self.http.get(url).send().await?.text().await?;
        let parsed = prom::parse(&text);

        snapshot.num_requests_running = parsed.get("num_requests_running").copied();
        snapshot.num_requests_waiting = parsed.get("num_requests_waiting").copied();
        snapshot.kv_cache_usage_perc = parsed.get("kv_cache_usage_perc").copied();
        snapshot.avg_generation_throughput = parsed.get("avg_generation_throughput").copied();
        snapshot.avg_prompt_throughput = parsed.get("avg_prompt_throughput").copied();
        snapshot.time_to_first_token_avg = prom::histogram_avg(&parsed, "time_to_first_token");

        let mut deltas = self.deltas.lock().unwrap();

        let gen_total = parsed.get("generation_tokens_total").copied();
        let gen_delta = non_negative_delta(&mut deltas.prev_generation_tokens, gen_total);
        let prompt_total = parsed.get("prompt_tokens_total").copied();
        let prompt_delta = non_negative_delta(&mut deltas.prev_prompt_tokens, prompt_total);

        if let Some(delta) = gen_delta.filter(|d| *d > 0.0) {
            if let Err(e) = self.lifetime.increment("completion_tokens_total", delta) {
                tracing::warn!(error = %e, "failed to persist completion_tokens_total");
            }
        }
        if let Some(delta) = prompt_delta.filter(|d| *d > 0.0) {
            if let Err(e) = self.lifetime.increment("prompt_tokens_total", delta) {
                tracing::warn!(error = %e, "failed to persist prompt_tokens_total");
            }
        }

        let tokens_delta = gen_delta.unwrap_or(0.0) + prompt_delta.unwrap_or(0.0);
        if tokens_delta > 0.0 {
            snapshot.tokens_per_second = Some(tokens_delta / self.tick.as_secs_f64());
            if let Err(e) = self.lifetime.increment("tokens_total", tokens_delta) {
                tracing::warn!(error = %e, "failed to persist tokens_total");
            }
        }

        let success_total = parsed.get("request_success_total").copied();
        let success_delta = non_negative_delta(&mut deltas.prev_request_success, success_total);
        if let Some(delta) = success_delta {
            if delta > 0.0 {
                if let Err(e) = self.lifetime.increment("requests_total", delta) {
                    tracing::warn!(error = %e, "failed to persist requests_total");
                }
            }
        }

        Ok(())
    }
}

/// Computes `current - previous` only when both are present and the result
/// is non-negative; a backend restart resets the upstream counter to zero,
/// which would otherwise show up as a large negative delta, so a reset is
/// simply ignored for that tick rather than reported.
fn non_negative_delta(previous: &mut Option<f64>, current: Option<f64>) -> Option<f64> {
    let current = current?;
    let delta = match *previous {
        Some(prev) if current >= prev => Some(current - prev),
        Some(_) => None,
        None => None,
    };
    *previous = Some(current);
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_none_on_first_observation() {
        let mut prev = None;
        assert_eq!(non_negative_delta(&mut prev, Some(10.0)), None);
        assert_eq!(prev, Some(10.0));
    }

    #[test]
    fn delta_is_computed_on_subsequent_observation() {
        let mut prev = Some(10.0);
        assert_eq!(non_negative_delta(&mut prev, Some(25.0)), Some(15.0));
    }

    #[test]
    fn delta_is_ignored_across_a_counter_reset() {
        let mut prev = Some(100.0);
        assert_eq!(non_negative_delta(&mut prev, Some(5.0)), None);
        assert_eq!(prev, Some(5.0));
    }
}
