//! NNP Plugin System
//!
//! Lua plugin host for the editor. Plugins are directories holding a
//! `manifest.json` and an entry script. Each loaded plugin runs in its own
//! Lua state with a memory limit and talks to the host through a fixed set
//! of capability tables (`plugin`, `ui`, `fs`, `settings`, `editor`).
//!
//! The [`PluginRegistry`] is single-threaded: it lives on the host's
//! control thread and every call into a plugin runs to completion.

mod capabilities;
pub mod config_store;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod events;
pub mod host;
pub mod manifest;
pub mod registry;
pub mod value;
pub mod version;

pub use config_store::ConfigStore;
pub use dispatch::parse_command_id;
pub use environment::{EnvironmentConfig, PluginContext, SettingsScope};
pub use error::PluginError;
pub use events::{BroadcastSummary, HostEvent, KNOWN_EVENTS};
pub use host::{
    EditorHandle, FileSystem, HeadlessInteraction, HostHandle, JsonSettingsStore, KeyValueStore,
    LocalFileSystem, MemorySettings, NoEditor, UserInteraction,
};
pub use manifest::{validate_plugin_dir, CommandDecl, PluginManifest, ValidatedManifest};
pub use registry::{CommandInfo, PluginInfo, PluginRegistry, RegistryConfig};
pub use value::{Arguments, ScriptTable, ScriptValue};
pub use version::is_version_compatible;
