//! Plugin registry: loads, tracks and drives plugin environments.
//!
//! The registry owns every loaded plugin's environment and the map of
//! plugins that failed to load. All iteration follows load order.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config_store::ConfigStore;
use crate::dispatch;
use crate::environment::{EnvironmentConfig, PluginContext, PluginEnvironment};
use crate::error::PluginError;
use crate::events::{self, BroadcastSummary, HostEvent};
use crate::host::HostHandle;
use crate::manifest::{PluginManifest, ValidatedManifest};
use crate::version::is_version_compatible;

// ─── Configuration ──────────────────────────────────────────────────

/// Registry-wide settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Version compared against each plugin's compatible-version range.
    pub host_version: String,
    /// Default directory scanned for plugins.
    pub plugin_dir: PathBuf,
    /// Directory holding `<plugin>.json` config files.
    pub config_dir: PathBuf,
    pub environment: EnvironmentConfig,
}

fn default_plugin_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nnp")
        .join("plugins")
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let plugin_dir = default_plugin_dir();
        Self {
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            config_dir: plugin_dir.join("config"),
            plugin_dir,
            environment: EnvironmentConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let plugin_dir = std::env::var("NNP_PLUGIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_plugin_dir());
        let config_dir = std::env::var("NNP_PLUGIN_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| plugin_dir.join("config"));

        Self {
            host_version: std::env::var("NNP_HOST_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            plugin_dir,
            config_dir,
            environment: EnvironmentConfig::from_env(),
        }
    }
}

// ─── State ──────────────────────────────────────────────────────────

/// A loaded plugin. Exists only while its environment is live.
pub(crate) struct PluginRecord {
    pub context: Rc<PluginContext>,
    pub environment: PluginEnvironment,
    pub enabled: bool,
    pub last_error: Option<String>,
    pub manifest: PluginManifest,
    pub loaded_at: DateTime<Utc>,
}

/// Shared registry state.
///
/// Borrows are short and never held across a call into a script.
pub(crate) struct RegistryState {
    pub config: RegistryConfig,
    pub config_store: ConfigStore,
    pub host: RefCell<Option<HostHandle>>,
    pub plugins: RefCell<HashMap<String, PluginRecord>>,
    pub load_order: RefCell<Vec<String>>,
    pub failed: RefCell<BTreeMap<String, FailedLoad>>,
    /// Plugins currently executing, innermost last.
    pub active: RefCell<Vec<String>>,
}

/// A load failure and the directory it came from.
pub(crate) struct FailedLoad {
    pub root: PathBuf,
    pub reason: String,
}

/// Snapshot of a loaded plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub root_path: PathBuf,
    pub enabled: bool,
    pub last_error: Option<String>,
    pub environment_id: Uuid,
    pub loaded_at: DateTime<Utc>,
    /// Interpreter memory in use, in bytes.
    pub memory_bytes: usize,
    pub config: HashMap<String, String>,
    pub registered_commands: Vec<String>,
    pub registered_events: Vec<String>,
    pub manifest: PluginManifest,
}

/// A command available to the host, for menus and palettes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    /// Qualified `<plugin>.<command>` id.
    pub id: String,
    pub plugin: String,
    pub title: String,
    /// Listed in the plugin manifest.
    pub declared: bool,
    /// Registered by the plugin script.
    pub has_handler: bool,
}

thread_local! {
    static GLOBAL: PluginRegistry = PluginRegistry::new(RegistryConfig::from_env());
}

// ─── Registry ───────────────────────────────────────────────────────

/// Handle to a plugin registry. Cheap to clone; not `Send`.
#[derive(Clone)]
pub struct PluginRegistry {
    state: Rc<RegistryState>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("initialized", &self.is_initialized())
            .field("loaded", &self.loaded_plugins())
            .field("failed", &self.state.failed.borrow().len())
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Create an empty, uninitialized registry.
    pub fn new(config: RegistryConfig) -> Self {
        let config_store = ConfigStore::new(config.config_dir.clone());
        Self {
            state: Rc::new(RegistryState {
                config,
                config_store,
                host: RefCell::new(None),
                plugins: RefCell::new(HashMap::new()),
                load_order: RefCell::new(Vec::new()),
                failed: RefCell::new(BTreeMap::new()),
                active: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The control thread's shared registry, configured from the environment.
    pub fn global() -> Self {
        GLOBAL.with(Clone::clone)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &RegistryState {
        &self.state
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.state.config
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.state.config_store
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Attach the host collaborators. Required before loading plugins.
    pub fn initialize(&self, host: HostHandle) -> Result<(), PluginError> {
        let mut slot = self.state.host.borrow_mut();
        if slot.is_some() {
            return Err(PluginError::AlreadyInitialized);
        }
        *slot = Some(host);
        tracing::info!(
            host_version = %self.state.config.host_version,
            config_dir = %self.state.config.config_dir.display(),
            "plugin registry initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.host.borrow().is_some()
    }

    /// Notify `shutdown`, unload every plugin, then clear all state.
    ///
    /// The registry can be initialized again afterwards.
    pub fn finalize(&self) -> Result<(), PluginError> {
        if !self.is_initialized() {
            return Err(PluginError::NotInitialized);
        }
        if let Some(plugin) = self.state.active.borrow().first() {
            return Err(PluginError::PluginBusy(plugin.clone()));
        }

        self.notify_shutdown();

        let order: Vec<String> = self.state.load_order.borrow().clone();
        for name in &order {
            if let Err(e) = self.unload_plugin(name) {
                tracing::error!(plugin = %name, "failed to unload plugin during finalize: {e}");
            }
        }

        self.state.plugins.borrow_mut().clear();
        self.state.load_order.borrow_mut().clear();
        self.state.failed.borrow_mut().clear();
        *self.state.host.borrow_mut() = None;

        tracing::info!(unloaded = order.len(), "plugin registry finalized");
        Ok(())
    }

    // ── Loading ─────────────────────────────────────────────────────

    /// Load every plugin directory directly under `dir`, in name order.
    ///
    /// Failures are recorded and do not stop the scan. Returns the names
    /// of the plugins that loaded.
    pub fn load_plugins_from_directory(&self, dir: impl AsRef<Path>) -> Result<Vec<String>, PluginError> {
        let dir = dir.as_ref();
        if !self.is_initialized() {
            return Err(PluginError::NotInitialized);
        }
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "plugin directory does not exist");
            return Ok(Vec::new());
        }

        let mut roots = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                roots.push(path);
            }
        }
        roots.sort();

        let mut loaded = Vec::new();
        for root in roots {
            if let Ok(name) = self.load_plugin(&root) {
                loaded.push(name);
            }
        }

        tracing::info!(
            dir = %dir.display(),
            loaded = loaded.len(),
            failed = self.state.failed.borrow().len(),
            "plugin directory scanned"
        );
        Ok(loaded)
    }

    /// Load a single plugin from its root directory. Returns its name.
    pub fn load_plugin(&self, root: impl AsRef<Path>) -> Result<String, PluginError> {
        let root = root.as_ref();
        let Some(host) = self.state.host.borrow().clone() else {
            return Err(PluginError::NotInitialized);
        };

        let manifest = match PluginManifest::read_from_dir(root) {
            Ok(manifest) => manifest,
            Err(e) => return Err(self.record_failure(&dir_key(root), root, e)),
        };

        let name = manifest.name.clone();
        let result = manifest
            .into_validated(root)
            .and_then(|validated| self.instantiate(validated, host));
        match result {
            Ok(()) => {
                // Only this directory's failures; another folder may have
                // failed under the same name.
                self.state
                    .failed
                    .borrow_mut()
                    .retain(|_, failure| failure.root != root);
                Ok(name)
            }
            Err(e) => Err(self.record_failure(&name, root, e)),
        }
    }

    fn instantiate(&self, validated: ValidatedManifest, host: HostHandle) -> Result<(), PluginError> {
        let ValidatedManifest {
            manifest,
            root,
            entry_path,
        } = validated;
        let name = manifest.name.clone();
        if self.state.plugins.borrow().contains_key(&name) {
            return Err(PluginError::AlreadyLoaded(name));
        }

        if let Some(range) = manifest.compatible_versions.as_deref() {
            let host_version = &self.state.config.host_version;
            if !is_version_compatible(range, host_version) {
                return Err(PluginError::VersionIncompatible {
                    required: range.to_string(),
                    host: host_version.clone(),
                });
            }
        }

        let config = self.state.config_store.load(&name);
        let context = Rc::new(PluginContext::new(
            name.clone(),
            manifest.version.clone(),
            manifest.description.clone(),
            manifest.author.clone(),
            root,
            config,
        ));

        let environment = PluginEnvironment::create(
            context.clone(),
            &entry_path,
            host,
            Rc::downgrade(&self.state),
            &self.state.config.environment,
        )?;

        let registered = environment.registered_commands();
        for decl in &manifest.commands {
            if !registered.contains(&decl.id) {
                tracing::warn!(plugin = %name, command = %decl.id, "declared command has no handler");
            }
        }

        tracing::info!(
            plugin = %name,
            version = %manifest.version,
            environment_id = %environment.id(),
            commands = ?registered,
            "plugin loaded"
        );

        let record = PluginRecord {
            context,
            environment,
            enabled: true,
            last_error: None,
            manifest,
            loaded_at: Utc::now(),
        };
        self.state.plugins.borrow_mut().insert(name.clone(), record);
        self.state.load_order.borrow_mut().push(name);
        Ok(())
    }

    /// Store a load failure and hand the error back.
    ///
    /// A key that names a loaded plugin is replaced by the root path so a
    /// name is never both loaded and failed.
    fn record_failure(&self, key: &str, root: &Path, error: PluginError) -> PluginError {
        let key = if self.state.plugins.borrow().contains_key(key) {
            root.display().to_string()
        } else {
            key.to_string()
        };
        tracing::error!(plugin = %key, root = %root.display(), "failed to load plugin: {error}");
        self.state.failed.borrow_mut().insert(
            key,
            FailedLoad {
                root: root.to_path_buf(),
                reason: error.to_string(),
            },
        );
        error
    }

    /// Tear down a plugin's environment and flush its config.
    pub fn unload_plugin(&self, name: &str) -> Result<(), PluginError> {
        if self.state.active.borrow().iter().any(|p| p == name) {
            return Err(PluginError::PluginBusy(name.to_string()));
        }

        let record = self
            .state
            .plugins
            .borrow_mut()
            .remove(name)
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;
        self.state.load_order.borrow_mut().retain(|n| n != name);

        if let Err(e) = self
            .state
            .config_store
            .save(name, &record.context.config())
        {
            tracing::warn!(plugin = %name, "failed to save plugin config: {e}");
        }

        let environment_id = record.environment.id();
        drop(record);

        tracing::info!(plugin = %name, environment_id = %environment_id, "plugin unloaded");
        Ok(())
    }

    /// Unload a plugin and load it again from the same root.
    pub fn reload_plugin(&self, name: &str) -> Result<String, PluginError> {
        let root = self
            .state
            .plugins
            .borrow()
            .get(name)
            .map(|r| r.context.root.clone())
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;
        self.unload_plugin(name)?;
        self.load_plugin(&root)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Run a registered command by its `<plugin>.<command>` id.
    pub fn execute_command(&self, command_id: &str) -> Result<(), PluginError> {
        dispatch::execute_command(&self.state, command_id)
    }

    /// Call a global function of a plugin with string arguments.
    pub fn call_plugin_function(
        &self,
        plugin: &str,
        function: &str,
        args: &[String],
    ) -> Result<String, PluginError> {
        dispatch::call_plugin_function(&self.state, plugin, function, args)
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn notify(&self, event: &HostEvent) -> BroadcastSummary {
        events::broadcast(&self.state, event)
    }

    pub fn notify_ready(&self) -> BroadcastSummary {
        self.notify(&HostEvent::Ready)
    }

    pub fn notify_shutdown(&self) -> BroadcastSummary {
        self.notify(&HostEvent::Shutdown)
    }

    pub fn notify_before_file_open(&self, filename: &str) -> BroadcastSummary {
        self.notify(&HostEvent::BeforeFileOpen(filename.to_string()))
    }

    pub fn notify_after_file_open(&self, filename: &str) -> BroadcastSummary {
        self.notify(&HostEvent::AfterFileOpen(filename.to_string()))
    }

    pub fn notify_before_file_save(&self, filename: &str) -> BroadcastSummary {
        self.notify(&HostEvent::BeforeFileSave(filename.to_string()))
    }

    pub fn notify_after_file_save(&self, filename: &str) -> BroadcastSummary {
        self.notify(&HostEvent::AfterFileSave(filename.to_string()))
    }

    pub fn notify_before_file_close(&self, filename: &str) -> BroadcastSummary {
        self.notify(&HostEvent::BeforeFileClose(filename.to_string()))
    }

    pub fn notify_after_file_close(&self, filename: &str) -> BroadcastSummary {
        self.notify(&HostEvent::AfterFileClose(filename.to_string()))
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Names of loaded plugins, in load order.
    pub fn loaded_plugins(&self) -> Vec<String> {
        self.state.load_order.borrow().clone()
    }

    /// Failed plugins keyed by name, directory name or root path.
    pub fn failed_plugins(&self) -> BTreeMap<String, String> {
        self.state
            .failed
            .borrow()
            .iter()
            .map(|(key, failure)| (key.clone(), failure.reason.clone()))
            .collect()
    }

    pub fn plugin_info(&self, name: &str) -> Option<PluginInfo> {
        let plugins = self.state.plugins.borrow();
        let record = plugins.get(name)?;
        Some(PluginInfo {
            name: record.context.name.clone(),
            version: record.context.version.clone(),
            description: record.context.description.clone(),
            author: record.context.author.clone(),
            root_path: record.context.root.clone(),
            enabled: record.enabled,
            last_error: record.last_error.clone(),
            environment_id: record.environment.id(),
            loaded_at: record.loaded_at,
            memory_bytes: record.environment.used_memory(),
            config: record.context.config(),
            registered_commands: record.environment.registered_commands(),
            registered_events: record.environment.registered_events(),
            manifest: record.manifest.clone(),
        })
    }

    pub fn plugin_version(&self, name: &str) -> Option<String> {
        self.state
            .plugins
            .borrow()
            .get(name)
            .map(|r| r.context.version.clone())
    }

    /// Commands of all loaded plugins, declared and registered, in load order.
    pub fn commands(&self) -> Vec<CommandInfo> {
        let plugins = self.state.plugins.borrow();
        let mut commands = Vec::new();

        for name in self.state.load_order.borrow().iter() {
            let Some(record) = plugins.get(name) else {
                continue;
            };
            let mut seen = Vec::new();
            for decl in &record.manifest.commands {
                let title = record.environment.command_title(&decl.id);
                commands.push(CommandInfo {
                    id: format!("{name}.{}", decl.id),
                    plugin: name.clone(),
                    has_handler: title.is_some(),
                    title: title.unwrap_or_else(|| decl.title.clone()),
                    declared: true,
                });
                seen.push(decl.id.clone());
            }
            for id in record.environment.registered_commands() {
                if seen.contains(&id) {
                    continue;
                }
                commands.push(CommandInfo {
                    id: format!("{name}.{id}"),
                    plugin: name.clone(),
                    title: record.environment.command_title(&id).unwrap_or_default(),
                    declared: false,
                    has_handler: true,
                });
            }
        }
        commands
    }

    /// Enable or disable dispatch and event delivery to a plugin.
    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> Result<(), PluginError> {
        let mut plugins = self.state.plugins.borrow_mut();
        let record = plugins
            .get_mut(name)
            .ok_or_else(|| PluginError::PluginNotFound(name.to_string()))?;
        record.enabled = enabled;
        tracing::info!(plugin = %name, enabled, "plugin enabled state changed");
        Ok(())
    }
}

/// Failure key for errors raised before the plugin name is known.
fn dir_key(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string())
}
