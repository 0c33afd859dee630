//! Per-plugin configuration files.
//!
//! Each plugin owns `<config_dir>/<name>.json`, a flat object of string
//! values. It is read when the plugin loads and rewritten when it unloads.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::PluginError;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, plugin_name: &str) -> PathBuf {
        self.dir.join(format!("{plugin_name}.json"))
    }

    /// Load a plugin's config.
    ///
    /// Missing, unreadable and non-object files load as an empty map.
    /// Non-string values load as `""`.
    pub fn load(&self, plugin_name: &str) -> HashMap<String, String> {
        let path = self.path_for(plugin_name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return HashMap::new(),
        };

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    plugin = %plugin_name,
                    path = %path.display(),
                    error = %e,
                    "plugin config is not valid JSON, starting empty"
                );
                return HashMap::new();
            }
        };

        let serde_json::Value::Object(map) = value else {
            tracing::warn!(
                plugin = %plugin_name,
                path = %path.display(),
                "plugin config is not a JSON object, starting empty"
            );
            return HashMap::new();
        };

        map.into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                _ => (k, String::new()),
            })
            .collect()
    }

    /// Overwrite a plugin's config file with `config`.
    pub fn save(
        &self,
        plugin_name: &str,
        config: &HashMap<String, String>,
    ) -> Result<(), PluginError> {
        std::fs::create_dir_all(&self.dir)?;
        let sorted: BTreeMap<&String, &String> = config.iter().collect();
        let json = serde_json::to_string_pretty(&sorted)?;
        std::fs::write(self.path_for(plugin_name), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_path_for() {
        let store = ConfigStore::new("/cfg");
        assert_eq!(store.path_for("word-count"), Path::new("/cfg/word-count.json"));
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config"));
        let cfg = config(&[("theme", "dark"), ("size", "12")]);

        store.save("demo", &cfg).unwrap();
        assert_eq!(store.load("demo"), cfg);
    }

    #[test]
    fn test_save_overwrites_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save("demo", &config(&[("a", "1"), ("b", "2")])).unwrap();
        store.save("demo", &config(&[("c", "3")])).unwrap();
        assert_eq!(store.load("demo"), config(&[("c", "3")]));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigStore::new(dir.path()).load("nobody").is_empty());
    }

    #[test]
    fn test_load_invalid_json_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        std::fs::write(store.path_for("demo"), "{{{").unwrap();
        assert!(store.load("demo").is_empty());
    }

    #[test]
    fn test_load_non_object_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        std::fs::write(store.path_for("demo"), r#"["a", "b"]"#).unwrap();
        assert!(store.load("demo").is_empty());
    }

    #[test]
    fn test_load_non_string_values_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        std::fs::write(
            store.path_for("demo"),
            r#"{ "name": "x", "count": 3, "flag": true, "nested": {} }"#,
        )
        .unwrap();
        let loaded = store.load("demo");
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded["name"], "x");
        assert_eq!(loaded["count"], "");
        assert_eq!(loaded["flag"], "");
    }

    #[test]
    fn test_saved_file_is_sorted_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save("demo", &config(&[("b", "2"), ("a", "1")])).unwrap();
        let content = std::fs::read_to_string(store.path_for("demo")).unwrap();
        assert!(content.find("\"a\"").unwrap() < content.find("\"b\"").unwrap());
    }
}
