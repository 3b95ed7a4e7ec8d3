//! Loads the flat directory of `*.json` recipe files named in
//! `Config::recipe_dir`. Recipe CRUD lives outside the controller; this
//! module only reads what's already on disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{ControllerError, Result};
use crate::recipe::Recipe;

/// Loads every `*.json` file directly under `dir` as a [`Recipe`], keyed by
/// its `id`. A malformed file is skipped with a warning rather than failing
/// the whole load.
pub fn load_dir(dir: &Path) -> Result<HashMap<String, Recipe>> {
    let mut out = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(ControllerError::Io(e)),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<Recipe>(&contents) {
            Ok(recipe) => {
                out.insert(recipe.id.clone(), recipe);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed recipe file");
            }
        }
    }
    Ok(out)
}

/// Thread-safe, reloadable recipe table keyed by id, with case-insensitive
/// lookup by id or served name. Matching is case-insensitive everywhere.
#[derive(Default)]
pub struct RecipeSet {
    recipes: RwLock<HashMap<String, Recipe>>,
}

impl RecipeSet {
    pub fn new(recipes: HashMap<String, Recipe>) -> Self {
        RecipeSet {
            recipes: RwLock::new(recipes),
        }
    }

    pub fn reload(&self, dir: &Path) -> Result<()> {
        let fresh = load_dir(dir)?;
        *self.recipes.write().unwrap() = fresh;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Recipe> {
        self.recipes.read().unwrap().get(id).cloned()
    }

    /// Looks up by exact id first, then falls back to a case-insensitive
    /// scan against id or served name (used by `EnsureRunning` and the chat
    /// proxy's auto-switch, which only have a model name to go on).
    pub fn find_matching(&self, name: &str) -> Option<Recipe> {
        let recipes = self.recipes.read().unwrap();
        if let Some(r) = recipes.get(name) {
            return Some(r.clone());
        }
        recipes.values().find(|r| r.matches(name)).cloned()
    }

    pub fn list(&self) -> Vec<Recipe> {
        self.recipes.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_valid_json_files_and_skips_malformed_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.json"),
            r#"{"id":"r1","backend":"vllm","model_path":"/m","served_name":"m"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "nope").unwrap();

        let loaded = load_dir(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("r1"));
    }

    #[test]
    fn missing_directory_yields_empty_set_not_error() {
        let loaded = load_dir(Path::new("/nonexistent/does/not/exist")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn find_matching_is_case_insensitive() {
        let mut map = HashMap::new();
        map.insert(
            "r1".to_string(),
            serde_json::from_value::<Recipe>(serde_json::json!({
                "id": "r1", "backend": "vllm", "model_path": "/m", "served_name": "Foo-7B"
            }))
            .unwrap(),
        );
        let set = RecipeSet::new(map);
        assert!(set.find_matching("foo-7b").is_some());
        assert!(set.find_matching("R1").is_some());
        assert!(set.find_matching("bar").is_none());
    }
}
