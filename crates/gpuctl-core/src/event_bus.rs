//! EventBus: multi-channel pub/sub with bounded per-subscriber
//! queues and an SSE wire-format encoder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::SSE_QUEUE_CAP;

pub const DEFAULT_CHANNEL: &str = "default";

pub fn log_channel(session_id: &str) -> String {
    format!("logs:{session_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    Gpu,
    Metrics,
    LaunchProgress,
    Log,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::Status => "status",
            EventType::Gpu => "gpu",
            EventType::Metrics => "metrics",
            EventType::LaunchProgress => "launch_progress",
            EventType::Log => "log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStage {
    Preempting,
    Evicting,
    Launching,
    Waiting,
    Cancelled,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Milliseconds since the Unix epoch at publish time.
    pub timestamp: u64,
    pub payload: Value,
}

impl Event {
    /// Renders the four-line SSE wire format:
    /// `id:`, `event:`, `data:` (single-line JSON of `{data, timestamp}`),
    /// blank line.
    pub fn to_sse(&self) -> String {
        let data = serde_json::json!({
            "data": self.payload,
            "timestamp": self.timestamp,
        });
        format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.event_type.as_str(),
            data
        )
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Subscribe(channel) -> stream of Event: allocates a bounded FIFO.
    pub fn subscribe(&self, channel: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SSE_QUEUE_CAP);
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { tx });
        rx
    }

    /// Publish(channel, event): non-blocking enqueue to every live
    /// subscriber of that channel; drops the event (and later the
    /// subscriber) on a full/closed queue.
    pub fn publish(&self, channel: &str, event_type: EventType, payload: Value) -> Event {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            event_type,
            timestamp: now_millis(),
            payload,
        };

        let mut channels = self.channels.lock().unwrap();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|s| match s.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Drop this event for this subscriber; mark as dead only
                    // once the receiver is actually gone (Closed), so a
                    // momentarily slow subscriber isn't evicted for one miss.
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        event
    }

    pub fn publish_status(&self, payload: Value) -> Event {
        self.publish(DEFAULT_CHANNEL, EventType::Status, payload)
    }

    pub fn publish_gpu(&self, payload: Value) -> Event {
        self.publish(DEFAULT_CHANNEL, EventType::Gpu, payload)
    }

    pub fn publish_metrics(&self, payload: Value) -> Event {
        self.publish(DEFAULT_CHANNEL, EventType::Metrics, payload)
    }

    pub fn publish_launch_progress(
        &self,
        recipe_id: &str,
        stage: LaunchStage,
        message: &str,
        progress: f32,
    ) -> Event {
        let payload = serde_json::json!({
            "recipe_id": recipe_id,
            "stage": stage,
            "message": message,
            "progress": progress.clamp(0.0, 1.0),
        });
        self.publish(DEFAULT_CHANNEL, EventType::LaunchProgress, payload)
    }

    pub fn publish_log_line(&self, session_id: &str, line: &str) -> Event {
        let payload = serde_json::json!({ "session_id": session_id, "line": line });
        self.publish(&log_channel(session_id), EventType::Log, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(DEFAULT_CHANNEL);
        bus.publish_status(serde_json::json!({"n": 1}));
        bus.publish_status(serde_json::json!({"n": 2}));
        bus.publish_status(serde_json::json!({"n": 3}));

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        let e3 = rx.recv().await.unwrap();
        assert!(e1.id < e2.id && e2.id < e3.id);
    }

    #[tokio::test]
    async fn log_events_go_to_session_channel_only() {
        let bus = EventBus::new();
        let mut default_rx = bus.subscribe(DEFAULT_CHANNEL);
        let mut log_rx = bus.subscribe(&log_channel("r1"));
        bus.publish_log_line("r1", "hello");

        assert!(log_rx.try_recv().is_ok());
        assert!(default_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_event_for_that_subscriber_without_killing_bus() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(DEFAULT_CHANNEL);
        for i in 0..(SSE_QUEUE_CAP as i64 + 10) {
            bus.publish_status(serde_json::json!({ "n": i }));
        }
        // Queue is full; draining should yield at most SSE_QUEUE_CAP events,
        // strictly increasing (no drop produces an out-of-order id).
        let mut last = None;
        let mut count = 0;
        while let Ok(e) = rx.try_recv() {
            if let Some(l) = last {
                assert!(e.id > l);
            }
            last = Some(e.id);
            count += 1;
        }
        assert!(count <= SSE_QUEUE_CAP);
    }

    #[test]
    fn sse_wire_format_has_four_lines() {
        let event = Event {
            id: 7,
            event_type: EventType::Gpu,
            timestamp: 123,
            payload: serde_json::json!({"x": 1}),
        };
        let wire = event.to_sse();
        let lines: Vec<&str> = wire.split('\n').collect();
        assert_eq!(lines[0], "id: 7");
        assert_eq!(lines[1], "event: gpu");
        assert!(lines[2].starts_with("data: "));
        assert_eq!(lines[3], "");
    }

    #[tokio::test]
    async fn dropped_receiver_is_eventually_removed() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe(DEFAULT_CHANNEL);
        } // receiver dropped here
        bus.publish_status(serde_json::json!({"n": 1}));
        let channels = bus.channels.lock().unwrap();
        assert!(channels.get(DEFAULT_CHANNEL).unwrap().is_empty());
    }
}
