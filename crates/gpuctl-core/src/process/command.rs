//! Composes the argv/env for a backend subprocess from a [`Recipe`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::recipe::{BackendKind, ExtraValue, Recipe};

pub struct BuiltCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Environment workarounds always applied regardless of recipe: a small
/// fixed set of env vars layered under the recipe's own overrides.
fn base_workaround_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    env.insert("TOKENIZERS_PARALLELISM".to_string(), "false".to_string());
    env
}

fn resolve_interpreter(recipe: &Recipe) -> String {
    if let Some(p) = &recipe.python_path {
        return p.to_string_lossy().into_owned();
    }
    if let Some(venv) = &recipe.venv_path {
        return venv.join("bin").join("python").to_string_lossy().into_owned();
    }
    "python3".to_string()
}

fn venv_vllm_wrapper(venv: &Path) -> Option<PathBuf> {
    let candidate = venv.join("bin").join("vllm");
    candidate.is_file().then_some(candidate)
}

/// Replaces `_` with `-` in a field name to produce a CLI flag name.
fn flag_name(field: &str) -> String {
    format!("--{}", field.replace('_', "-"))
}

fn kebab_keys_to_snake(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.replace('-', "_"), kebab_keys_to_snake(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(kebab_keys_to_snake).collect()),
        other => other,
    }
}

/// Appends the `extra_args` map as pass-through flags.
fn push_extra_args(args: &mut Vec<String>, extra_args: &BTreeMap<String, ExtraValue>) {
    for (key, value) in extra_args {
        if key.eq_ignore_ascii_case("env_vars") || key.eq_ignore_ascii_case("cuda_visible_devices")
        {
            // Handled separately as environment, not argv.
            continue;
        }
        match value {
            ExtraValue::Bool(true) => {
                args.push(flag_name(key));
            }
            ExtraValue::Bool(false) => {
                // Omitted unless the recipe author spelled out an explicit
                // disable-family flag name, which they do by giving it its
                // own string/bool key (e.g. "disable_log_stats": true).
            }
            ExtraValue::Number(n) => {
                args.push(flag_name(key));
                if n.fract() == 0.0 {
                    args.push(format!("{}", *n as i64));
                } else {
                    args.push(n.to_string());
                }
            }
            ExtraValue::String(s) => {
                args.push(flag_name(key));
                args.push(s.clone());
            }
            ExtraValue::Json(json) => {
                args.push(flag_name(key));
                let normalized = kebab_keys_to_snake(json.clone());
                args.push(normalized.to_string());
            }
        }
    }
}

fn find_extra_ci<'a>(
    extra_args: &'a BTreeMap<String, ExtraValue>,
    name: &str,
) -> Option<&'a ExtraValue> {
    extra_args
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn collect_env(recipe: &Recipe) -> BTreeMap<String, String> {
    let mut env = base_workaround_env();
    for (k, v) in &recipe.env_vars {
        env.insert(k.clone(), v.clone());
    }
    if let Some(ExtraValue::Json(Value::Object(map))) = find_extra_ci(&recipe.extra_args, "env_vars") {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                env.insert(k.clone(), s.to_string());
            }
        }
    }
    if let Some(cuda) = find_extra_ci(&recipe.extra_args, "cuda_visible_devices") {
        let val = match cuda {
            ExtraValue::String(s) => s.clone(),
            ExtraValue::Number(n) => n.to_string(),
            ExtraValue::Json(j) => j.to_string(),
            ExtraValue::Bool(b) => b.to_string(),
        };
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), val);
    }
    env
}

/// Builds the full argv + env for launching `recipe` bound to `port`.
pub fn build_command(recipe: &Recipe, port: u16) -> BuiltCommand {
    let interpreter = resolve_interpreter(recipe);
    let env = collect_env(recipe);

    let mut args: Vec<String> = Vec::new();
    let program;

    match recipe.backend {
        BackendKind::Vllm => {
            if let Some(venv) = &recipe.venv_path {
                if let Some(wrapper) = venv_vllm_wrapper(venv) {
                    program = wrapper.to_string_lossy().into_owned();
                    args.push("serve".to_string());
                    args.push(recipe.model_path.to_string_lossy().into_owned());
                } else {
                    program = interpreter;
                    args.push("-m".to_string());
                    args.push("vllm.entrypoints.openai.api_server".to_string());
                    args.push("--model".to_string());
                    args.push(recipe.model_path.to_string_lossy().into_owned());
                }
            } else {
                program = interpreter;
                args.push("-m".to_string());
                args.push("vllm.entrypoints.openai.api_server".to_string());
                args.push("--model".to_string());
                args.push(recipe.model_path.to_string_lossy().into_owned());
            }
        }
        BackendKind::SgLang => {
            program = interpreter;
            args.push("-m".to_string());
            args.push("sglang.launch_server".to_string());
            args.push("--model-path".to_string());
            args.push(recipe.model_path.to_string_lossy().into_owned());
        }
        BackendKind::Fallback => {
            // TabbyAPI/ExLlamaV3-style launcher: a plain `main.py --config
            // <path>` invocation, matched on its command line rather than a
            // dedicated module entrypoint.
            program = interpreter;
            args.push("main.py".to_string());
            args.push("--config".to_string());
            args.push(recipe.model_path.to_string_lossy().into_owned());
        }
    }

    args.push("--port".to_string());
    args.push(port.to_string());
    args.push("--served-model-name".to_string());
    args.push(recipe.served_name.clone());

    if recipe.tensor_parallel_size > 1 {
        args.push("--tensor-parallel-size".to_string());
        args.push(recipe.tensor_parallel_size.to_string());
    }
    if let Some(ctx) = recipe.context_length {
        args.push("--max-model-len".to_string());
        args.push(ctx.to_string());
    }
    if let Some(mem) = recipe.gpu_memory_fraction {
        args.push("--gpu-memory-utilization".to_string());
        args.push(mem.to_string());
    }
    if let Some(cap) = recipe.max_num_seqs {
        args.push("--max-num-seqs".to_string());
        args.push(cap.to_string());
    }
    if let Some(q) = &recipe.quantization {
        args.push("--quantization".to_string());
        args.push(q.clone());
    }
    if let Some(dtype) = &recipe.dtype {
        args.push("--dtype".to_string());
        args.push(dtype.clone());
    }
    if let Some(parser) = &recipe.tool_call_parser {
        args.push("--tool-call-parser".to_string());
        args.push(parser.clone());
        args.push("--enable-auto-tool-choice".to_string());
    }
    if let Some(parser) = &recipe.reasoning_parser {
        args.push("--reasoning-parser".to_string());
        args.push(parser.clone());
    }

    push_extra_args(&mut args, &recipe.extra_args);

    BuiltCommand { program, args, env }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn base_recipe() -> Recipe {
        Recipe {
            id: "r1".into(),
            backend: BackendKind::Vllm,
            model_path: "/models/foo".into(),
            served_name: "foo".into(),
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
        }
    }

    #[test]
    fn vllm_module_entrypoint_without_venv() {
        let recipe = base_recipe();
        let built = build_command(&recipe, 8001);
        assert_eq!(built.program, "python3");
        assert!(built.args.contains(&"vllm.entrypoints.openai.api_server".to_string()));
        assert!(built.args.windows(2).any(|w| w == ["--port".to_string(), "8001".to_string()]));
    }

    #[test]
    fn boolean_true_flag_is_bare() {
        let mut recipe = base_recipe();
        recipe
            .extra_args
            .insert("enforce_eager".into(), ExtraValue::Bool(true));
        let built = build_command(&recipe, 8001);
        assert!(built.args.contains(&"--enforce-eager".to_string()));
    }

    #[test]
    fn boolean_false_flag_is_omitted() {
        let mut recipe = base_recipe();
        recipe
            .extra_args
            .insert("enforce_eager".into(), ExtraValue::Bool(false));
        let built = build_command(&recipe, 8001);
        assert!(!built.args.iter().any(|a| a.contains("enforce-eager")));
    }

    #[test]
    fn cuda_visible_devices_becomes_env_not_arg() {
        let mut recipe = base_recipe();
        recipe.extra_args.insert(
            "cuda_visible_devices".into(),
            ExtraValue::String("0,1".into()),
        );
        let built = build_command(&recipe, 8001);
        assert_eq!(built.env.get("CUDA_VISIBLE_DEVICES"), Some(&"0,1".to_string()));
        assert!(!built.args.iter().any(|a| a.contains("cuda-visible-devices")));
    }

    #[test]
    fn json_extra_arg_normalizes_kebab_keys_to_snake() {
        let mut recipe = base_recipe();
        recipe.extra_args.insert(
            "speculative_config".into(),
            ExtraValue::Json(serde_json::json!({"num-speculative-tokens": 5})),
        );
        let built = build_command(&recipe, 8001);
        let idx = built
            .args
            .iter()
            .position(|a| a == "--speculative-config")
            .unwrap();
        assert!(built.args[idx + 1].contains("num_speculative_tokens"));
    }

    #[test]
    fn fallback_backend_uses_main_py_config_form() {
        let mut recipe = base_recipe();
        recipe.backend = BackendKind::Fallback;
        recipe.model_path = "/etc/tabby/config.yml".into();
        let built = build_command(&recipe, 8000);
        assert!(built.args.contains(&"main.py".to_string()));
        assert!(built.args.windows(2).any(|w| w
            == ["--config".to_string(), "/etc/tabby/config.yml".to_string()]));
    }

    #[test]
    fn sglang_uses_launch_server_module() {
        let mut recipe = base_recipe();
        recipe.backend = BackendKind::SgLang;
        let built = build_command(&recipe, 9000);
        assert!(built.args.contains(&"sglang.launch_server".to_string()));
    }

    #[test]
    fn venv_with_vllm_wrapper_uses_serve_form() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("vllm"), "#!/bin/sh\n").unwrap();
        let mut recipe = base_recipe();
        recipe.venv_path = Some(dir.path().to_path_buf());
        let built = build_command(&recipe, 8001);
        assert_eq!(built.program, bin.join("vllm").to_string_lossy());
        assert_eq!(built.args[0], "serve");
    }
}
