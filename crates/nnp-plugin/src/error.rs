//! Plugin host error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    // ── Load-time failures ───────────────────────────────────────────
    #[error("manifest.json not found in {}", .0.display())]
    MissingManifest(PathBuf),

    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("plugin name is empty")]
    EmptyName,

    #[error("entry file not found: {}", .0.display())]
    MissingEntryPoint(PathBuf),

    #[error("version incompatible: plugin requires {required}, host is {host}")]
    VersionIncompatible { required: String, host: String },

    #[error("failed to create script environment: {0}")]
    EnvironmentCreationFailed(String),

    #[error("failed to load plugin script: {0}")]
    ScriptLoadError(String),

    #[error("script error: {0}")]
    ScriptExecutionError(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    // ── Dispatch failures ────────────────────────────────────────────
    #[error("invalid command id: '{0}'")]
    InvalidCommandId(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("plugin is disabled: {0}")]
    PluginDisabled(String),

    #[error("plugin is busy: {0}")]
    PluginBusy(String),

    #[error("reentrant call into plugin: {0}")]
    ReentrantCall(String),

    // ── Registry lifecycle ───────────────────────────────────────────
    #[error("plugin registry is not initialized")]
    NotInitialized,

    #[error("plugin registry is already initialized")]
    AlreadyInitialized,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
