//! Plugin manifest parsing and validation.
//!
//! Parses the `manifest.json` file at the root of every plugin directory and
//! resolves the plugin's entry script.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// File name of the manifest inside a plugin root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Entry script used when the manifest does not declare one.
pub const DEFAULT_ENTRY: &str = "init.lua";

/// Characters a plugin name must not contain.
///
/// The name is the first segment of every command id and the stem of the
/// plugin's config file.
const FORBIDDEN_NAME_CHARS: &[char] = &['.', '/', '\\'];

/// Plugin manifest parsed from `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Host versions this plugin supports, formatted `[min, max]`.
    #[serde(
        default,
        rename = "nnp-compatible-versions",
        skip_serializing_if = "Option::is_none"
    )]
    pub compatible_versions: Option<String>,
    #[serde(default)]
    pub commands: Vec<CommandDecl>,
    /// Fields the plugin host does not consume, kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A command declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDecl {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// A manifest that passed validation, with its resolved entry script.
#[derive(Debug, Clone)]
pub struct ValidatedManifest {
    pub manifest: PluginManifest,
    pub root: PathBuf,
    pub entry_path: PathBuf,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), PluginError> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(PluginError::MalformedManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    for component in p.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(PluginError::MalformedManifest(format!(
                "{field_name} must not contain '..': '{path}'"
            )));
        }
    }
    Ok(())
}

fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    if name.trim().is_empty() {
        return Err(PluginError::EmptyName);
    }
    if let Some(ch) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(PluginError::MalformedManifest(format!(
            "plugin name contains invalid character '{ch}': '{name}'"
        )));
    }
    Ok(())
}

impl PluginManifest {
    /// Parse and validate a manifest from its JSON text.
    pub fn parse(json: &str) -> Result<Self, PluginError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| PluginError::MalformedManifest(e.to_string()))?;

        if !value.is_object() {
            return Err(PluginError::MalformedManifest(
                "top level must be a JSON object".into(),
            ));
        }

        let mut manifest: PluginManifest = serde_json::from_value(value)
            .map_err(|e| PluginError::MalformedManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read `manifest.json` from a plugin root and validate it.
    pub fn read_from_dir(root: &Path) -> Result<Self, PluginError> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(PluginError::MissingManifest(root.to_path_buf()));
        }

        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            PluginError::MalformedManifest(format!(
                "failed to read {}: {e}",
                manifest_path.display()
            ))
        })?;

        Self::parse(&content)
    }

    /// Validate the fields consumed by the plugin host.
    ///
    /// Declared commands with an empty id or title are dropped.
    fn validate(&mut self) -> Result<(), PluginError> {
        validate_plugin_name(&self.name)?;

        if let Some(entry) = self.entry.as_deref() {
            validate_path_safety(entry, "entry")?;
        }

        let name = self.name.clone();
        self.commands.retain(|cmd| {
            let keep = !cmd.id.is_empty() && !cmd.title.is_empty();
            if !keep {
                tracing::warn!(
                    plugin = %name,
                    id = %cmd.id,
                    "declared command is missing id or title, ignoring"
                );
            }
            keep
        });

        Ok(())
    }

    /// Entry script relative to the plugin root.
    pub fn entry(&self) -> &str {
        match self.entry.as_deref() {
            Some(entry) if !entry.is_empty() => entry,
            _ => DEFAULT_ENTRY,
        }
    }

    /// Resolve the entry script against the plugin root.
    pub fn resolve_entry_point(&self, root: &Path) -> Result<PathBuf, PluginError> {
        let entry_path = root.join(self.entry());
        if !entry_path.is_file() {
            return Err(PluginError::MissingEntryPoint(entry_path));
        }
        Ok(entry_path)
    }

    /// Resolve the entry script and pair it with the manifest.
    pub fn into_validated(self, root: &Path) -> Result<ValidatedManifest, PluginError> {
        let entry_path = self.resolve_entry_point(root)?;
        Ok(ValidatedManifest {
            manifest: self,
            root: root.to_path_buf(),
            entry_path,
        })
    }
}

/// Validate a plugin directory: manifest presence, content and entry script.
pub fn validate_plugin_dir(root: &Path) -> Result<ValidatedManifest, PluginError> {
    PluginManifest::read_from_dir(root)?.into_validated(root)
}

// ─── Tests ──────────────────────────────────────────────────────────
