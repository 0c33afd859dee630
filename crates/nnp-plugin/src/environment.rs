//! Isolated Lua environment, one per loaded plugin.
//!
//! Each plugin gets its own interpreter state with a memory limit, its own
//! globals and its own handler table. Nothing is shared between two
//! environments except the host collaborators behind the capability surface.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use mlua::{Function, Lua, LuaOptions, StdLib, Table, Value};
use uuid::Uuid;

use crate::capabilities::{self, CapabilityScope};
use crate::error::PluginError;
use crate::host::HostHandle;
use crate::registry::RegistryState;

// ─── Configuration ──────────────────────────────────────────────────

/// How `settings.*` keys map onto the shared host store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SettingsScope {
    /// Every plugin reads and writes the same keys.
    #[default]
    Global,
    /// Keys are prefixed with `<plugin name>.`.
    PerPlugin,
}

impl SettingsScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" => Some(Self::Global),
            "plugin" | "per-plugin" | "per_plugin" => Some(Self::PerPlugin),
            _ => None,
        }
    }
}

/// Configuration applied to every plugin environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Maximum interpreter memory in bytes (default: 64 MB, 0 = unlimited).
    pub memory_limit: usize,
    pub settings_scope: SettingsScope,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            settings_scope: SettingsScope::Global,
        }
    }
}

impl EnvironmentConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGIN_LUA_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(64)
                * 1024
                * 1024,
            settings_scope: std::env::var("PLUGIN_SETTINGS_SCOPE")
                .ok()
                .and_then(|v| SettingsScope::parse(&v))
                .unwrap_or_default(),
        }
    }
}

// ─── Plugin context ─────────────────────────────────────────────────

/// Identity and live config of a plugin, shared with its capabilities.
#[derive(Debug)]
pub struct PluginContext {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub root: PathBuf,
    config: RefCell<HashMap<String, String>>,
}

impl PluginContext {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        author: impl Into<String>,
        root: impl Into<PathBuf>,
        config: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
            author: author.into(),
            root: root.into(),
            config: RefCell::new(config),
        }
    }

    pub fn config(&self) -> HashMap<String, String> {
        self.config.borrow().clone()
    }

    pub fn replace_config(&self, config: HashMap<String, String>) {
        *self.config.borrow_mut() = config;
    }
}

// ─── Handler table ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct CommandHandler {
    pub title: String,
    pub function: Function,
}

/// Command and event handlers registered by one plugin.
#[derive(Debug, Default)]
pub(crate) struct HandlerTable {
    commands: BTreeMap<String, CommandHandler>,
    events: BTreeMap<String, Function>,
}

impl HandlerTable {
    /// Returns `true` when an earlier handler was replaced.
    pub fn register_command(&mut self, id: String, title: String, function: Function) -> bool {
        self.commands
            .insert(id, CommandHandler { title, function })
            .is_some()
    }

    /// Returns `true` when an earlier handler was replaced.
    pub fn register_event(&mut self, name: String, function: Function) -> bool {
        self.events.insert(name, function).is_some()
    }

    pub fn command(&self, id: &str) -> Option<&CommandHandler> {
        self.commands.get(id)
    }

    pub fn event(&self, name: &str) -> Option<&Function> {
        self.events.get(name)
    }

    pub fn command_ids(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.events.clear();
    }
}

// ─── Environment ────────────────────────────────────────────────────

/// A plugin's interpreter state and handler table.
///
/// Owned exclusively by the registry record of a loaded plugin. Dropping
/// it clears the handlers and destroys the interpreter.
pub(crate) struct PluginEnvironment {
    id: Uuid,
    plugin_name: String,
    lua: Lua,
    handlers: Rc<RefCell<HandlerTable>>,
}

impl std::fmt::Debug for PluginEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEnvironment")
            .field("id", &self.id)
            .field("plugin_name", &self.plugin_name)
            .finish_non_exhaustive()
    }
}

impl PluginEnvironment {
    /// Build the environment and run the plugin's entry script.
    pub fn create(
        context: Rc<PluginContext>,
        entry_path: &Path,
        host: HostHandle,
        registry: Weak<RegistryState>,
        config: &EnvironmentConfig,
    ) -> Result<Self, PluginError> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())
            .map_err(|e| PluginError::EnvironmentCreationFailed(e.to_string()))?;

        if config.memory_limit > 0 {
            lua.set_memory_limit(config.memory_limit)
                .map_err(|e| PluginError::EnvironmentCreationFailed(e.to_string()))?;
        }

        let handlers = Rc::new(RefCell::new(HandlerTable::default()));
        let scope = CapabilityScope {
            plugin: context.clone(),
            host,
            handlers: handlers.clone(),
            registry,
            settings_scope: config.settings_scope,
        };
        capabilities::install(&lua, scope)
            .map_err(|e| PluginError::EnvironmentCreationFailed(e.to_string()))?;
        set_package_path(&lua, &context.root)
            .map_err(|e| PluginError::EnvironmentCreationFailed(e.to_string()))?;

        let source = std::fs::read_to_string(entry_path).map_err(|e| {
            PluginError::ScriptLoadError(format!("{}: {e}", entry_path.display()))
        })?;
        let chunk = lua
            .load(source.as_str())
            .set_name(format!("@{}", entry_path.display()))
            .into_function()
            .map_err(|e| PluginError::ScriptLoadError(e.to_string()))?;

        let environment = Self {
            id: Uuid::new_v4(),
            plugin_name: context.name.clone(),
            lua,
            handlers,
        };

        // On failure `environment` drops here and tears the state down.
        chunk
            .call::<()>(())
            .map_err(|e| PluginError::ScriptExecutionError(e.to_string()))?;

        tracing::debug!(
            plugin = %environment.plugin_name,
            environment_id = %environment.id,
            commands = ?environment.registered_commands(),
            events = ?environment.registered_events(),
            "entry script executed"
        );

        Ok(environment)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn command_handler(&self, id: &str) -> Option<Function> {
        self.handlers
            .borrow()
            .command(id)
            .map(|h| h.function.clone())
    }

    pub fn command_title(&self, id: &str) -> Option<String> {
        self.handlers.borrow().command(id).map(|h| h.title.clone())
    }

    pub fn event_handler(&self, name: &str) -> Option<Function> {
        self.handlers.borrow().event(name).cloned()
    }

    /// A global function by name, for cross-plugin calls.
    pub fn global_function(&self, name: &str) -> Option<Function> {
        match self.lua.globals().get::<Value>(name) {
            Ok(Value::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn registered_commands(&self) -> Vec<String> {
        self.handlers.borrow().command_ids()
    }

    pub fn registered_events(&self) -> Vec<String> {
        self.handlers.borrow().event_names()
    }

    /// Interpreter memory currently in use, in bytes.
    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }
}

impl Drop for PluginEnvironment {
    fn drop(&mut self) {
        // Handlers hold references into the state; release them first.
        if let Ok(mut handlers) = self.handlers.try_borrow_mut() {
            handlers.clear();
        }
        tracing::debug!(
            plugin = %self.plugin_name,
            environment_id = %self.id,
            "environment destroyed"
        );
    }
}

/// Let `require` find modules inside the plugin root first.
fn set_package_path(lua: &Lua, root: &Path) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    let existing: String = package.get("path")?;
    let root = root.display();
    package.set("path", format!("{root}/?.lua;{root}/?/init.lua;{existing}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemorySettings;

    fn context(root: &Path) -> Rc<PluginContext> {
        Rc::new(PluginContext::new(
            "demo",
            "1.0.0",
            "Demo plugin",
            "Tester",
            root,
            HashMap::new(),
        ))
    }

    fn create(root: &Path, script: &str) -> Result<PluginEnvironment, PluginError> {
        let entry = root.join("init.lua");
        std::fs::write(&entry, script).unwrap();
        PluginEnvironment::create(
            context(root),
            &entry,
            HostHandle::headless().with_settings(MemorySettings::default()),
            Weak::new(),
            &EnvironmentConfig::default(),
        )
    }

    // ── Configuration ───────────────────────────────────────────────

    #[test]
    fn test_environment_config_default() {
        let config = EnvironmentConfig::default();
        assert_eq!(config.memory_limit, 64 * 1024 * 1024);
        assert_eq!(config.settings_scope, SettingsScope::Global);
    }

    #[test]
    fn test_environment_config_from_env() {
        std::env::set_var("PLUGIN_LUA_MEMORY_LIMIT_MB", "16");
        std::env::set_var("PLUGIN_SETTINGS_SCOPE", "plugin");

        let config = EnvironmentConfig::from_env();
        assert_eq!(config.memory_limit, 16 * 1024 * 1024);
        assert_eq!(config.settings_scope, SettingsScope::PerPlugin);

        std::env::remove_var("PLUGIN_LUA_MEMORY_LIMIT_MB");
        std::env::remove_var("PLUGIN_SETTINGS_SCOPE");

        let config_default = EnvironmentConfig::from_env();
        assert_eq!(config_default.settings_scope, SettingsScope::Global);
    }

    #[test]
    fn test_settings_scope_parse() {
        assert_eq!(SettingsScope::parse("Global"), Some(SettingsScope::Global));
        assert_eq!(SettingsScope::parse("per-plugin"), Some(SettingsScope::PerPlugin));
        assert_eq!(SettingsScope::parse("nope"), None);
    }

    // ── Construction ────────────────────────────────────────────────

    #[test]
    fn test_create_registers_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let env = create(
            dir.path(),
            r#"
            plugin.registerCommand({ id = "hello", title = "Say Hello", execute = function() end })
            plugin.on("ready", function() end)
            function helper() return "ok" end
            "#,
        )
        .unwrap();

        assert_eq!(env.registered_commands(), vec!["hello"]);
        assert_eq!(env.registered_events(), vec!["ready"]);
        assert_eq!(env.command_title("hello").as_deref(), Some("Say Hello"));
        assert!(env.command_handler("hello").is_some());
        assert!(env.event_handler("shutdown").is_none());
        let helper = env.global_function("helper").unwrap();
        assert_eq!(helper.call::<String>(()).unwrap(), "ok");
        assert!(env.global_function("missing").is_none());
    }

    #[test]
    fn test_global_non_function_is_not_callable() {
        let dir = tempfile::tempdir().unwrap();
        let env = create(dir.path(), "answer = 42").unwrap();
        assert!(env.global_function("answer").is_none());
    }

    #[test]
    fn test_syntax_error_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = create(dir.path(), "function (").unwrap_err();
        assert!(matches!(err, PluginError::ScriptLoadError(_)), "got: {err:?}");
    }

    #[test]
    fn test_runtime_error_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = create(dir.path(), "error('boom')").unwrap_err();
        match err {
            PluginError::ScriptExecutionError(msg) => assert!(msg.contains("boom")),
            other => panic!("expected ScriptExecutionError, got: {other:?}"),
        }
    }

    #[test]
    fn test_unreadable_entry_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PluginEnvironment::create(
            context(dir.path()),
            &dir.path().join("missing.lua"),
            HostHandle::headless(),
            Weak::new(),
            &EnvironmentConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::ScriptLoadError(_)));
    }

    #[test]
    fn test_unsafe_libraries_absent() {
        let dir = tempfile::tempdir().unwrap();
        let env = create(dir.path(), "has_debug = debug ~= nil").unwrap();
        let has_debug: bool = env.lua().globals().get("has_debug").unwrap();
        assert!(!has_debug);
    }

    #[test]
    fn test_require_resolves_plugin_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("util.lua"), "return { twice = function(x) return x * 2 end }")
            .unwrap();
        let env = create(dir.path(), "local util = require('util') result = util.twice(21)").unwrap();
        let result: i64 = env.lua().globals().get("result").unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_memory_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("init.lua");
        std::fs::write(&entry, "local t = {} for i = 1, 1e7 do t[i] = ('x'):rep(64) .. i end").unwrap();
        let config = EnvironmentConfig {
            memory_limit: 2 * 1024 * 1024,
            ..EnvironmentConfig::default()
        };
        let err = PluginEnvironment::create(
            context(dir.path()),
            &entry,
            HostHandle::headless(),
            Weak::new(),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::ScriptExecutionError(_)), "got: {err:?}");
    }

    #[test]
    fn test_each_environment_has_fresh_id() {
        let dir = tempfile::tempdir().unwrap();
        let a = create(dir.path(), "").unwrap();
        let b = create(dir.path(), "").unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.used_memory() > 0);
    }

    // ── Handler table ───────────────────────────────────────────────

    #[test]
    fn test_handler_table_replace_and_clear() {
        let lua = Lua::new();
        let f1: Function = lua.load("return function() return 1 end").eval().unwrap();
        let f2: Function = lua.load("return function() return 2 end").eval().unwrap();

        let mut table = HandlerTable::default();
        assert!(!table.register_event("ready".into(), f1));
        assert!(table.register_event("ready".into(), f2));
        assert_eq!(table.event("ready").unwrap().call::<i64>(()).unwrap(), 2);

        table.clear();
        assert!(table.event_names().is_empty());
        assert!(table.command_ids().is_empty());
    }
}
