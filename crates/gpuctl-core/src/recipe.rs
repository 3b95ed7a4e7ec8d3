//! Recipe: the immutable input to a launch.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One of the backend families this controller knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Vllm,
    SgLang,
    /// A backend that is neither vLLM nor SGLang — e.g. TabbyAPI/ExLlamaV3,
    /// recognized by `main.py --config` on its command line rather than by a
    /// dedicated module entrypoint, and without a `--port` flag of its own.
    Fallback,
}

/// A scalar, boolean, or arbitrary JSON value in a recipe's `extra_args` map
/// (REDESIGN FLAGS §9: untyped dynamic config -> tagged sum type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Bool(bool),
    Number(f64),
    String(String),
    Json(serde_json::Value),
}

impl ExtraValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ExtraValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    /// Stable, unique identifier.
    pub id: String,
    pub backend: BackendKind,
    pub model_path: PathBuf,
    pub served_name: String,
    #[serde(default = "default_tp")]
    pub tensor_parallel_size: u32,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default)]
    pub gpu_memory_fraction: Option<f32>,
    #[serde(default)]
    pub max_num_seqs: Option<u32>,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub tool_call_parser: Option<String>,
    #[serde(default)]
    pub reasoning_parser: Option<String>,
    /// Extra CLI flags, keyed by the field name (underscores; translated to
    /// kebab-case flags at spawn time).
    #[serde(default)]
    pub extra_args: BTreeMap<String, ExtraValue>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub python_path: Option<PathBuf>,
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
}

fn default_tp() -> u32 {
    1
}

impl Recipe {
    /// Case-insensitive match against either the served name or the recipe id
    ///.
    pub fn matches(&self, name: &str) -> bool {
        self.served_name.eq_ignore_ascii_case(name) || self.id.eq_ignore_ascii_case(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_is_case_insensitive() {
        let r = Recipe {
            id: "r1".into(),
            backend: BackendKind::Vllm,
            model_path: "/models/foo".into(),
            served_name: "Foo-7B".into(),
            tensor_parallel_size: 1,
            context_length: None,
            gpu_memory_fraction: None,
            max_num_seqs: None,
            quantization: None,
            dtype: None,
            tool_call_parser: None,
            reasoning_parser: None,
            extra_args: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            python_path: None,
            venv_path: None,
        };
        assert!(r.matches("foo-7b"));
        assert!(r.matches("R1"));
        assert!(!r.matches("bar"));
    }

    #[test]
    fn extra_args_accepts_mixed_types() {
        let json = serde_json::json!({
            "id": "r1",
            "backend": "vllm",
            "model_path": "/m",
            "served_name": "m",
            "extra_args": {
                "enforce_eager": true,
                "swap_space": 4,
                "served_model_name": "m",
                "config": {"speculative-config": {"method": "ngram"}}
            }
        });
        let recipe: Recipe = serde_json::from_value(json).unwrap();
        assert_eq!(
            recipe.extra_args.get("enforce_eager"),
            Some(&ExtraValue::Bool(true))
        );
        assert_eq!(
            recipe.extra_args.get("swap_space"),
            Some(&ExtraValue::Number(4.0))
        );
    }
}
