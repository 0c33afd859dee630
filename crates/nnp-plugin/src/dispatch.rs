//! Command and function dispatch into plugin environments.
//!
//! Resolution happens under a short registry borrow; the handler itself
//! runs with no registry borrow held, so scripts may call back into the
//! registry. A stack of currently executing plugins rejects reentry.

use std::rc::Weak;
use std::time::Instant;

use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua, Value, Variadic};

use crate::environment::PluginEnvironment;
use crate::error::PluginError;
use crate::registry::RegistryState;

/// Split `<plugin>.<command>` at the first dot.
pub fn parse_command_id(command_id: &str) -> Result<(&str, &str), PluginError> {
    match command_id.split_once('.') {
        Some((plugin, command)) if !plugin.is_empty() && !command.is_empty() => {
            Ok((plugin, command))
        }
        _ => Err(PluginError::InvalidCommandId(command_id.to_string())),
    }
}

/// A resolved handler, detached from the registry borrow.
pub(crate) struct Target {
    lua: Lua,
    function: Function,
}

/// Resolve a handler inside a loaded, enabled plugin.
pub(crate) fn resolve(
    state: &RegistryState,
    plugin: &str,
    lookup: impl FnOnce(&PluginEnvironment) -> Option<Function>,
    missing: impl FnOnce() -> PluginError,
) -> Result<Target, PluginError> {
    let plugins = state.plugins.borrow();
    let record = plugins
        .get(plugin)
        .ok_or_else(|| PluginError::PluginNotFound(plugin.to_string()))?;
    if !record.enabled {
        return Err(PluginError::PluginDisabled(plugin.to_string()));
    }
    let function = lookup(&record.environment).ok_or_else(missing)?;
    Ok(Target {
        lua: record.environment.lua().clone(),
        function,
    })
}

/// Marks a plugin as executing for as long as the guard lives.
struct ActiveCall<'a> {
    state: &'a RegistryState,
    plugin: String,
}

impl<'a> ActiveCall<'a> {
    fn enter(state: &'a RegistryState, plugin: &str) -> Result<Self, PluginError> {
        let mut active = state.active.borrow_mut();
        if active.iter().any(|p| p == plugin) {
            return Err(PluginError::ReentrantCall(plugin.to_string()));
        }
        active.push(plugin.to_string());
        Ok(Self {
            state,
            plugin: plugin.to_string(),
        })
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        let mut active = self.state.active.borrow_mut();
        if let Some(pos) = active.iter().rposition(|p| *p == self.plugin) {
            active.remove(pos);
        }
    }
}

/// Run a resolved handler with the recursion guard in place.
///
/// Script errors are logged, stored as the plugin's last error and
/// returned as [`PluginError::ScriptExecutionError`].
pub(crate) fn invoke<A, R>(
    state: &RegistryState,
    plugin: &str,
    handler: &str,
    target: &Target,
    args: A,
) -> Result<R, PluginError>
where
    A: IntoLuaMulti,
    R: FromLuaMulti,
{
    let _guard = ActiveCall::enter(state, plugin)?;
    let start = Instant::now();

    match target.function.call::<R>(args) {
        Ok(result) => {
            tracing::debug!(
                plugin = %plugin,
                handler = %handler,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "handler completed"
            );
            Ok(result)
        }
        Err(e) => {
            let msg = e.to_string();
            tracing::error!(
                plugin = %plugin,
                handler = %handler,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "plugin handler failed: {msg}"
            );
            if let Some(record) = state.plugins.borrow_mut().get_mut(plugin) {
                record.last_error = Some(msg.clone());
            }
            Err(PluginError::ScriptExecutionError(msg))
        }
    }
}

/// Run `<plugin>.<command>` with no arguments, discarding its results.
pub(crate) fn execute_command(state: &RegistryState, command_id: &str) -> Result<(), PluginError> {
    let (plugin, command) = parse_command_id(command_id)?;
    let target = resolve(
        state,
        plugin,
        |env| env.command_handler(command),
        || PluginError::CommandNotFound(command_id.to_string()),
    )?;
    invoke::<_, ()>(state, plugin, command_id, &target, ())
}

/// Call a global function of `plugin` with string arguments.
///
/// A string result is returned as-is and a number in its script string
/// form. Any other result is `""`.
pub(crate) fn call_plugin_function(
    state: &RegistryState,
    plugin: &str,
    function: &str,
    args: &[String],
) -> Result<String, PluginError> {
    let target = resolve(
        state,
        plugin,
        |env| env.global_function(function),
        || PluginError::FunctionNotFound(format!("{plugin}.{function}")),
    )?;
    let args: Variadic<String> = args.iter().cloned().collect();
    let value: Value = invoke(state, plugin, function, &target, args)?;

    Ok(match value {
        Value::String(s) => s.to_string_lossy(),
        v @ (Value::Integer(_) | Value::Number(_)) => target
            .lua
            .coerce_string(v)
            .ok()
            .flatten()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default(),
        _ => String::new(),
    })
}

/// `plugin.call` from inside a script. Failures are logged and yield `""`.
pub(crate) fn call_from_plugin(
    registry: &Weak<RegistryState>,
    caller: &str,
    plugin: &str,
    function: &str,
    args: &[String],
) -> String {
    let Some(state) = registry.upgrade() else {
        tracing::warn!(caller = %caller, target = %plugin, function = %function, "plugin registry is gone");
        return String::new();
    };

    match call_plugin_function(&state, plugin, function, args) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(
                caller = %caller,
                target = %plugin,
                function = %function,
                "cross-plugin call failed: {e}"
            );
            String::new()
        }
    }
}
