//! ChatProxy: auto-switch + transparent OpenAI
//! chat-completions forwarding with streaming repair. Request/response
//! shapes are `serde_json::Value` surgery throughout, including the
//! reconstructed tool-call objects this module builds itself, because the
//! repairs patch arbitrary nested fields mid-stream and a typed
//! `async_openai` message wouldn't round-trip the rest of the payload
//! untouched.

pub mod repair;
pub mod tool_calls;

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::config;
use crate::error::{ControllerError, Result};
use crate::supervisor::Supervisor;
use tool_calls::ParsedToolCall;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, ControllerError>> + Send>>;

pub enum ProxyOutcome {
    NonStreaming(Value),
    Streaming(ByteStream),
}

pub struct ChatProxy {
    http: reqwest::Client,
    upstream_base_url: String,
    upstream_token: Option<String>,
    supervisor: Arc<Supervisor>,
}

impl ChatProxy {
    pub fn new(
        upstream_base_url: String,
        upstream_token: Option<String>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        ChatProxy {
            http: reqwest::Client::builder()
                .timeout(config::UPSTREAM_CHAT_TIMEOUT)
                .build()
                .expect("building reqwest client"),
            upstream_base_url,
            upstream_token,
            supervisor,
        }
    }

    /// Handles one `/v1/chat/completions` request end to end: auto-switch,
    /// forward, and (for streaming requests) hand back a lazily-repaired
    /// byte stream.
    pub async fn handle(&self, body: Value) -> Result<ProxyOutcome> {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

        // Step 1 — auto-switch.
        if let Some(model) = &model {
            match self.supervisor.ensure_running(model).await {
                Ok(()) => {}
                // No recipe matches this model: let the upstream gateway
                // route it externally.
                Err(ControllerError::NotFound(_)) => {}
                Err(e) => return Err(ControllerError::UpstreamUnreachable(e.to_string())),
            }
        }

        // Step 2 — forward.
        let url = format!(
            "{}/v1/chat/completions",
            self.upstream_base_url.trim_end_matches('/')
        );
        let mut req = self.http.post(url).json(&body);
        if let Some(token) = &self.upstream_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ControllerError::UpstreamUnreachable(e.to_string())
            } else {
                ControllerError::Other(anyhow::anyhow!("upstream request failed: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(ControllerError::UpstreamError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        if streaming {
            Ok(ProxyOutcome::Streaming(stream_repaired(resp)))
        } else {
            let value: Value = resp
                .json()
                .await
                .map_err(|e| ControllerError::Other(anyhow::anyhow!("decoding upstream response: {e}")))?;
            Ok(ProxyOutcome::NonStreaming(repair_non_streaming(value)))
        }
    }
}

/// Applies the think-tag / duplicate-reasoning / empty-tool-name repairs to
/// one already-parsed SSE `data:` payload, in place.
fn repair_event_json(
    raw_text: &str,
    value: &mut Value,
    think: &mut repair::ThinkTagState,
    buffer: &mut repair::StreamBuffer,
) {
    repair::strip_duplicate_reasoning(raw_text, value);

    let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for choice in choices {
        let Some(delta) = choice.get_mut("delta").and_then(Value::as_object_mut) else {
            continue;
        };

        if delta.get("reasoning_content").and_then(Value::as_str).is_none() {
            if let Some(content) = delta.get("content").and_then(Value::as_str).map(str::to_string) {
                let split = think.apply(&content);
                match split.content {
                    Some(c) => {
                        delta.insert("content".to_string(), Value::String(c.clone()));
                        buffer.push(&c);
                    }
                    None => {
                        delta.insert("content".to_string(), Value::Null);
                    }
                }
                if let Some(r) = split.reasoning {
                    buffer.push(&r);
                    delta.insert("reasoning_content".to_string(), Value::String(r));
                }
            }
        } else if let Some(r) = delta.get("reasoning_content").and_then(Value::as_str) {
            buffer.push(r);
        }

        if let Some(tool_calls) = delta.get_mut("tool_calls").and_then(Value::as_array_mut) {
            for call in tool_calls {
                buffer.mark_tool_call_seen();
                let Some(func) = call.get_mut("function").and_then(Value::as_object_mut) else {
                    continue;
                };
                if let Some(args) = func.get("arguments").and_then(Value::as_str) {
                    buffer.push(args);
                }
                let name_is_empty = func.get("name").and_then(Value::as_str).map(str::is_empty).unwrap_or(true);
                if name_is_empty {
                    if let Some(recovered) = buffer.recover_name() {
                        func.insert("name".to_string(), Value::String(recovered));
                    }
                }
            }
        }
    }
}

/// Processes one complete SSE event (everything up to, but not including,
/// the blank-line separator) and returns its re-encoded replacement, or
/// `None` if the drop-rule ate it.
fn process_event(
    event_text: &str,
    think: &mut repair::ThinkTagState,
    buffer: &mut repair::StreamBuffer,
) -> Option<String> {
    if repair::should_drop_chunk(event_text) {
        return None;
    }

    let mut out_lines = Vec::new();
    for line in event_text.lines() {
        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            out_lines.push(line.to_string());
            continue;
        };
        let payload = payload.trim_start();
        if payload == "[DONE]" {
            out_lines.push("data: [DONE]".to_string());
            continue;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(mut value) => {
                repair_event_json(payload, &mut value, think, buffer);
                out_lines.push(format!("data: {value}"));
            }
            Err(e) => {
                tracing::warn!(error = %e, "chat proxy: passing through unparseable SSE payload");
                out_lines.push(line.to_string());
            }
        }
    }
    Some(format!("{}\n\n", out_lines.join("\n")))
}

fn to_tool_call_values(calls: &[ParsedToolCall]) -> Vec<Value> {
    calls
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "type": "function",
                "function": { "name": c.name, "arguments": c.arguments },
            })
        })
        .collect()
}

fn to_tool_call_chunk_values(calls: &[ParsedToolCall]) -> Vec<Value> {
    calls
        .iter()
        .enumerate()
        .map(|(i, c)| {
            serde_json::json!({
                "index": i,
                "id": c.id,
                "type": "function",
                "function": { "name": c.name, "arguments": c.arguments },
            })
        })
        .collect()
}

fn encode_synthetic_tool_call_chunk(calls: &[ParsedToolCall]) -> String {
    let tool_calls = to_tool_call_chunk_values(calls);
    let payload = serde_json::json!({
        "choices": [{
            "index": 0,
            "delta": { "tool_calls": tool_calls },
            "finish_reason": "tool_calls",
        }],
    });
    format!("data: {payload}\n\n")
}

/// The streaming repair pipeline: buffers upstream
/// bytes into complete SSE events, repairs each one, and — if the stream
/// ends without ever emitting a real tool call but the buffered text still
/// looks like one — injects a synthetic final chunk before `[DONE]`.
fn stream_repaired(resp: reqwest::Response) -> ByteStream {
    let stream = async_stream::stream! {
        let mut byte_stream = resp.bytes_stream();
        let mut carry = String::new();
        let mut think = repair::ThinkTagState::default();
        let mut buffer = repair::StreamBuffer::default();

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "upstream SSE read error; ending stream");
                    break;
                }
            };
            carry.push_str(&String::from_utf8_lossy(&chunk));

            loop {
                let Some(sep) = carry.find("\n\n") else { break };
                let event_text = carry[..sep].to_string();
                let remainder = carry[sep + 2..].to_string();
                carry = remainder;

                if event_text.contains("[DONE]") {
                    if !buffer.saw_any_tool_call() && tool_calls::looks_like_tool_call(buffer.text()) {
                        let calls = tool_calls::parse_tool_calls(buffer.text());
                        if !calls.is_empty() {
                            yield Ok(Bytes::from(encode_synthetic_tool_call_chunk(&calls)));
                        }
                    }
                    if let Some(out) = process_event(&event_text, &mut think, &mut buffer) {
                        yield Ok(Bytes::from(out));
                    }
                    break 'outer;
                }

                if let Some(out) = process_event(&event_text, &mut think, &mut buffer) {
                    yield Ok(Bytes::from(out));
                }
            }
        }
    };
    Box::pin(stream)
}

/// Non-streaming repair: parse
/// once, attach reconstructed tool calls if the message has none but its
/// content matches a known pattern.
fn repair_non_streaming(mut value: Value) -> Value {
    let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) else {
        return value;
    };
    for choice in choices {
        let Some(message) = choice.get_mut("message") else {
            continue;
        };
        let has_tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if has_tool_calls {
            continue;
        }
        let content = message.get("content").and_then(Value::as_str).unwrap_or("");
        let reasoning = message
            .get("reasoning_content")
            .and_then(Value::as_str)
            .unwrap_or("");
        let combined = format!("{content}{reasoning}");
        if !tool_calls::looks_like_tool_call(&combined) {
            continue;
        }
        let calls = tool_calls::parse_tool_calls(&combined);
        if calls.is_empty() {
            continue;
        }
        let tool_call_values = to_tool_call_values(&calls);
        if let Some(obj) = message.as_object_mut() {
            obj.insert("tool_calls".to_string(), Value::Array(tool_call_values));
            obj.insert("content".to_string(), Value::Null);
        }
        if let Some(obj) = choice.as_object_mut() {
            obj.insert("finish_reason".to_string(), Value::String("tool_calls".to_string()));
        }
    }
    value
}
