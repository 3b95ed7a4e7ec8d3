//! The six tool-call reconstruction patterns, tried in order,
//! stopping at the first pattern that yields any match.

use std::ops::Range;
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    /// Always a JSON-encoded string, even when the source was already a
    /// dict.
    pub arguments: String,
}

fn fresh_call_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let hex: String = (0..9).map(|_| HEX[rng.gen_range(0..16)] as char).collect();
    format!("call_{hex}")
}

/// Scans `text` for every syntactically balanced `{...}` JSON object
/// (string-literal and escape aware) and returns the ones that parse.
/// Objects are non-overlapping: once one is matched the scan resumes past
/// its end.
fn find_json_objects(text: &str) -> Vec<(Range<usize>, Value)> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_brace_end(text, i) {
                if let Ok(value) = serde_json::from_str::<Value>(&text[i..end]) {
                    out.push((i..end, value));
                    i = end;
                    continue;
                }
            }
        }
        i += 1;
    }
    out
}

fn balanced_brace_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (idx, ch) in text[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn value_has_string_field(value: &Value, field: &str) -> bool {
    value.get(field).and_then(Value::as_str).is_some()
}

fn make_call(name: &str, arguments: &Value) -> ParsedToolCall {
    let arguments = match arguments {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ParsedToolCall {
        id: fresh_call_id(),
        name: name.to_string(),
        arguments,
    }
}

fn mcp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<?use_mcp_tool>\s*<?server_name>(?P<server>.*?)</server_name>\s*<?tool_name>(?P<tool>.*?)</tool_name>\s*<?arguments>(?P<args>.*?)</arguments>\s*</\s*use_mcp[_ ]?tool>"#,
        )
        .unwrap()
    })
}

/// Pattern 1: MCP XML form.
fn parse_mcp_xml(text: &str) -> Vec<ParsedToolCall> {
    mcp_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let server = caps.name("server")?.as_str().trim();
            let tool = caps.name("tool")?.as_str().trim();
            let raw_args = caps.name("args")?.as_str().replace("<think>", "").replace("</think>", "");
            let args: Value = serde_json::from_str(raw_args.trim()).unwrap_or(Value::Object(Default::default()));
            let name = if server.is_empty() {
                tool.to_string()
            } else {
                format!("{server}__{tool}")
            };
            Some(make_call(&name, &args))
        })
        .collect()
}

/// Pattern 2: a JSON object with `name`/`arguments` immediately followed by
/// a dangling `</tool_call>` with no opening tag anywhere in the text.
fn parse_dangling_close(text: &str) -> Vec<ParsedToolCall> {
    if text.contains("<tool_call>") {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (range, value) in find_json_objects(text) {
        if !value_has_string_field(&value, "name") || value.get("arguments").is_none() {
            continue;
        }
        let after = text[range.end..].trim_start();
        if after.starts_with("</tool_call>") {
            let name = value["name"].as_str().unwrap().to_string();
            out.push(make_call(&name, &value["arguments"]));
        }
    }
    out
}

/// Pattern 3: balanced `<tool_call>...</tool_call>` blocks.
fn parse_balanced_blocks(text: &str) -> Vec<ParsedToolCall> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("<tool_call>") {
        let after_open = &rest[open + "<tool_call>".len()..];
        let Some(close) = after_open.find("</tool_call>") else {
            break;
        };
        let inner = &after_open[..close];
        if let Ok(value) = serde_json::from_str::<Value>(inner.trim()) {
            if let Some(name) = value.get("name").and_then(Value::as_str) {
                let args = value.get("arguments").or_else(|| value.get("parameters")).cloned().unwrap_or_default();
                out.push(make_call(name, &args));
            }
        }
        rest = &after_open[close + "</tool_call>".len()..];
    }
    out
}

fn glm_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<\|action_start\|><\|plugin\|>\s*(?P<json>\{.*?\})\s*<\|action_end\|>").unwrap()
    })
}

/// Pattern 4: GLM action form.
fn parse_glm_action(text: &str) -> Vec<ParsedToolCall> {
    glm_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let json_str = caps.name("json")?.as_str();
            let value: Value = serde_json::from_str(json_str).ok()?;
            let name = value.get("name").and_then(Value::as_str)?;
            let args = value.get("arguments").or_else(|| value.get("parameters")).cloned().unwrap_or_default();
            Some(make_call(name, &args))
        })
        .collect()
}

/// Pattern 5: raw JSON with `name` and either `arguments` or `parameters`.
fn parse_raw_json(text: &str) -> Vec<ParsedToolCall> {
    find_json_objects(text)
        .into_iter()
        .filter_map(|(_, value)| {
            let name = value.get("name").and_then(Value::as_str)?;
            let args = value.get("arguments").or_else(|| value.get("parameters"))?;
            Some(make_call(name, args))
        })
        .collect()
}

/// Pattern 6: fallback — any JSON object with a `name` field.
fn parse_fallback_name_only(text: &str) -> Vec<ParsedToolCall> {
    find_json_objects(text)
        .into_iter()
        .filter_map(|(_, value)| {
            let name = value.get("name").and_then(Value::as_str)?;
            let args = value
                .get("arguments")
                .or_else(|| value.get("parameters"))
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            Some(make_call(name, &args))
        })
        .collect()
}

/// Applies all six patterns in order, returning the first non-empty result.
pub fn parse_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    for parser in [
        parse_mcp_xml as fn(&str) -> Vec<ParsedToolCall>,
        parse_dangling_close,
        parse_balanced_blocks,
        parse_glm_action,
        parse_raw_json,
        parse_fallback_name_only,
    ] {
        let found = parser(text);
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

/// True when `text` carries any of the signature substrings
/// names as triggers for attempting tool-call reconstruction.
pub fn looks_like_tool_call(text: &str) -> bool {
    text.contains("</tool_call>")
        || text.contains("<tool_call>")
        || text.contains("</use_mcp_tool>")
        || text.contains("use_mcp_tool>")
        || (text.contains("\"name\"") && text.contains("\"arguments\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_balanced_tool_call_block() {
        let text = r#"blah <tool_call>{"name": "get_weather", "arguments": {"city": "NYC"}}</tool_call> trailing"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert!(calls[0].arguments.contains("NYC"));
    }

    #[test]
    fn parses_dangling_close_without_opening_tag() {
        let text = r#"{"name": "search", "arguments": {"q": "rust"}}</tool_call>"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
    }

    #[test]
    fn parses_mcp_xml_form_with_missing_opening_angle_bracket() {
        let text = r#"?use_mcp_tool>?server_name>weather</server_name>?tool_name>get_forecast</tool_name>?arguments>{"city": "NYC"}</arguments></use_mcp_tool>"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "weather__get_forecast");
    }

    #[test]
    fn parses_mcp_xml_form_with_space_in_closing_tag() {
        let text = r#"<use_mcp_tool><server_name>exa</server_name><tool_name>search</tool_name><arguments>{"q": "x"}</arguments></use_mcp tool>"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "exa__search");
    }

    #[test]
    fn parses_glm_action_form() {
        let text = r#"<|action_start|><|plugin|>{"name": "lookup", "parameters": {"id": 7}}<|action_end|>"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "lookup");
    }

    #[test]
    fn falls_back_to_name_only_object() {
        let text = r#"random preamble {"name": "noop"} trailing"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "noop");
    }

    #[test]
    fn no_match_yields_empty() {
        assert!(parse_tool_calls("just plain text, nothing to see").is_empty());
    }

    #[test]
    fn detects_trigger_substrings() {
        assert!(looks_like_tool_call("...</tool_call>"));
        assert!(looks_like_tool_call(r#"{"name": "x", "arguments": {}}"#));
        assert!(!looks_like_tool_call("plain content"));
    }

    #[test]
    fn call_ids_are_nine_hex_chars_with_prefix() {
        let id = fresh_call_id();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), "call_".len() + 9);
        assert!(id["call_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
