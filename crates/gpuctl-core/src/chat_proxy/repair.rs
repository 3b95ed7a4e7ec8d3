//! Per-request repair state threaded across a streamed response:
//! think-tag splitting, duplicate-reasoning removal, empty-tool-name
//! recovery, and the noise drop-rule.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Drop-rule: an upstream gateway bug emits chunks that are pure noise.
pub fn should_drop_chunk(raw: &str) -> bool {
    raw.contains("\"role\":\"user\"") && raw.contains("\"tool_calls\":[]")
}

fn name_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""name"\s*:\s*"([^"]*)""#).unwrap())
}

/// If the chunk text carries both `reasoning` and `reasoning_content`,
/// delete the `reasoning` key from every `delta` object (duplicate-field
/// repair). Operates on the already-parsed SSE-line JSON value.
pub fn strip_duplicate_reasoning(raw_text: &str, value: &mut Value) {
    if !(raw_text.contains("\"reasoning\"") && raw_text.contains("\"reasoning_content\"")) {
        return;
    }
    if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices {
            if let Some(delta) = choice.get_mut("delta").and_then(Value::as_object_mut) {
                delta.remove("reasoning");
            }
        }
    }
}

/// The think-tag splitting state machine. One instance per in-flight
/// request.
#[derive(Debug, Default)]
pub struct ThinkTagState {
    in_thinking: bool,
    seen_open_tag: bool,
}

/// Result of applying the think-tag repair to one delta's raw `content`.
pub struct ThinkSplit {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

impl ThinkTagState {
    /// `content` is the delta's raw text; only called when
    /// `reasoning_content` was NOT already set on this delta (the caller
    /// leaves the delta alone otherwise).
    pub fn apply(&mut self, content: &str) -> ThinkSplit {
        const OPEN: &str = "<think>";
        const CLOSE: &str = "</think>";

        if !self.in_thinking {
            if !self.seen_open_tag {
                if let Some(close_idx) = content.find(CLOSE) {
                    let reasoning = content[..close_idx].to_string();
                    let rest = content[close_idx + CLOSE.len()..].to_string();
                    return ThinkSplit {
                        content: non_empty(rest),
                        reasoning: non_empty(reasoning),
                    };
                }
            }
            if let Some(open_idx) = content.find(OPEN) {
                self.seen_open_tag = true;
                let pre = content[..open_idx].to_string();
                let after_open = &content[open_idx + OPEN.len()..];
                if let Some(close_idx) = after_open.find(CLOSE) {
                    let reasoning = after_open[..close_idx].to_string();
                    let rest = &after_open[close_idx + CLOSE.len()..];
                    let mut new_content = pre;
                    new_content.push_str(rest);
                    return ThinkSplit {
                        content: non_empty(new_content),
                        reasoning: non_empty(reasoning),
                    };
                }
                self.in_thinking = true;
                return ThinkSplit {
                    content: non_empty(pre),
                    reasoning: non_empty(after_open.to_string()),
                };
            }
            ThinkSplit {
                content: non_empty(content.to_string()),
                reasoning: None,
            }
        } else if let Some(close_idx) = content.find(CLOSE) {
            let reasoning = content[..close_idx].to_string();
            let rest = content[close_idx + CLOSE.len()..].to_string();
            self.in_thinking = false;
            ThinkSplit {
                content: non_empty(rest),
                reasoning: non_empty(reasoning),
            }
        } else {
            ThinkSplit {
                content: None,
                reasoning: non_empty(content.to_string()),
            }
        }
    }
}

/// Accumulates streamed text across a request so the empty-tool-name repair
/// and end-of-stream tool-call reconstruction have something to search.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    text: String,
    saw_any_tool_call: bool,
}

impl StreamBuffer {
    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    pub fn mark_tool_call_seen(&mut self) {
        self.saw_any_tool_call = true;
    }

    pub fn saw_any_tool_call(&self) -> bool {
        self.saw_any_tool_call
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Empty-tool-name repair: finds the first `"name":"..."` in the
    /// accumulated buffer to backfill a tool call whose name streamed empty.
    pub fn recover_name(&self) -> Option<String> {
        name_field_re()
            .captures(&self.text)
            .map(|c| c[1].to_string())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_rule_matches_noise_chunk() {
        assert!(should_drop_chunk(r#"{"role":"user","tool_calls":[]}"#));
        assert!(!should_drop_chunk(r#"{"role":"assistant","content":"hi"}"#));
    }

    #[test]
    fn duplicate_reasoning_key_is_removed_from_every_delta() {
        let raw = r#"{"choices":[{"delta":{"reasoning":"dup","reasoning_content":"keep"}}]}"#;
        let mut value: Value = serde_json::from_str(raw).unwrap();
        strip_duplicate_reasoning(raw, &mut value);
        let delta = &value["choices"][0]["delta"];
        assert!(delta.get("reasoning").is_none());
        assert_eq!(delta["reasoning_content"], "keep");
    }

    #[test]
    fn duplicate_reasoning_untouched_when_only_one_field_present() {
        let raw = r#"{"choices":[{"delta":{"reasoning_content":"keep"}}]}"#;
        let mut value: Value = serde_json::from_str(raw).unwrap();
        strip_duplicate_reasoning(raw, &mut value);
        assert_eq!(value["choices"][0]["delta"]["reasoning_content"], "keep");
    }

    #[test]
    fn think_tag_idempotent_without_any_tags() {
        let mut state = ThinkTagState::default();
        let split = state.apply("just plain content");
        assert_eq!(split.content.as_deref(), Some("just plain content"));
        assert!(split.reasoning.is_none());
    }

    #[test]
    fn think_tag_opens_and_stays_open_across_chunks() {
        let mut state = ThinkTagState::default();
        let first = state.apply("before <think>reasoning so far");
        assert_eq!(first.content.as_deref(), Some("before "));
        assert_eq!(first.reasoning.as_deref(), Some("reasoning so far"));

        let second = state.apply("more reasoning");
        assert!(second.content.is_none());
        assert_eq!(second.reasoning.as_deref(), Some("more reasoning"));

        let third = state.apply("closing now</think> and content after");
        assert_eq!(third.content.as_deref(), Some(" and content after"));
        assert_eq!(third.reasoning.as_deref(), Some("closing now"));
    }

    #[test]
    fn think_tag_close_without_prior_open_treats_prefix_as_reasoning() {
        let mut state = ThinkTagState::default();
        let split = state.apply("hidden reasoning</think>visible content");
        assert_eq!(split.reasoning.as_deref(), Some("hidden reasoning"));
        assert_eq!(split.content.as_deref(), Some("visible content"));
    }

    #[test]
    fn think_tag_open_and_close_in_same_chunk() {
        let mut state = ThinkTagState::default();
        let split = state.apply("pre<think>thought</think>post");
        assert_eq!(split.content.as_deref(), Some("prepost"));
        assert_eq!(split.reasoning.as_deref(), Some("thought"));
        assert!(!state.in_thinking);
    }

    #[test]
    fn recover_name_finds_first_name_field() {
        let mut buf = StreamBuffer::default();
        buf.push(r#"preamble "name":"get_weather" more text"#);
        assert_eq!(buf.recover_name().as_deref(), Some("get_weather"));
    }
}
