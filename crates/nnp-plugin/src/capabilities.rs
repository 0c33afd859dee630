//! Native functions exposed to plugin scripts.
//!
//! Installs the `plugin`, `ui`, `fs`, `settings` and `editor` tables into a
//! plugin's globals. Every function is a thin adapter over a host
//! collaborator, the plugin's own context, or the registry.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use mlua::{Function, IntoLuaMulti, Lua, Table, Variadic};

use crate::dispatch;
use crate::environment::{HandlerTable, PluginContext, SettingsScope};
use crate::error::PluginError;
use crate::events;
use crate::host::HostHandle;
use crate::registry::RegistryState;
use crate::value::{Arguments, ScriptTable, ScriptValue};

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Sanitize a log message from a plugin.
///
/// Strips control characters (except newline/tab), truncates to max length.
pub(crate) fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

/// Everything a plugin's capabilities act on.
pub(crate) struct CapabilityScope {
    pub plugin: Rc<PluginContext>,
    pub host: HostHandle,
    pub handlers: Rc<RefCell<HandlerTable>>,
    pub registry: Weak<RegistryState>,
    pub settings_scope: SettingsScope,
}

impl CapabilityScope {
    /// Relative paths are taken from the plugin root.
    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.plugin.root.join(p)
        }
    }

    fn settings_key(&self, key: &str) -> String {
        match self.settings_scope {
            SettingsScope::Global => key.to_string(),
            SettingsScope::PerPlugin => format!("{}.{key}", self.plugin.name),
        }
    }
}

/// Install all capability tables into `lua`'s globals.
pub(crate) fn install(lua: &Lua, scope: CapabilityScope) -> mlua::Result<()> {
    let scope = Rc::new(scope);
    let globals = lua.globals();
    globals.set("plugin", plugin_table(lua, &scope)?)?;
    globals.set("ui", ui_table(lua, &scope)?)?;
    globals.set("fs", fs_table(lua, &scope)?)?;
    globals.set("settings", settings_table(lua, &scope)?)?;
    globals.set("editor", editor_table(lua, &scope)?)?;
    Ok(())
}

/// Wrap a capability so its arguments arrive as [`Arguments`] and its
/// errors are raised into the script.
fn function<R, F>(lua: &Lua, name: &'static str, f: F) -> mlua::Result<Function>
where
    R: IntoLuaMulti,
    F: Fn(&Lua, Arguments) -> Result<R, PluginError> + 'static,
{
    lua.create_function(move |lua, args: Variadic<ScriptValue>| {
        f(lua, Arguments::new(name, args.into_iter().collect())).map_err(mlua::Error::external)
    })
}

// ─── plugin.* ───────────────────────────────────────────────────────

fn plugin_table(lua: &Lua, scope: &Rc<CapabilityScope>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let s = scope.clone();
    table.set(
        "info",
        function(lua, "plugin.info", move |_, _| {
            let p = &s.plugin;
            Ok(ScriptTable::new()
                .with_field("name", p.name.as_str())
                .with_field("version", p.version.as_str())
                .with_field("description", p.description.as_str())
                .with_field("author", p.author.as_str())
                .with_field("rootPath", p.root.display().to_string()))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "getConfig",
        function(lua, "plugin.getConfig", move |_, _| {
            Ok(ScriptTable::from_string_map(&s.plugin.config()))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "saveConfig",
        function(lua, "plugin.saveConfig", move |_, args| {
            let config = args.table(1, "config")?.to_string_map();
            s.plugin.replace_config(config);
            Ok(true)
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "getRootPath",
        function(lua, "plugin.getRootPath", move |_, _| {
            Ok(s.plugin.root.display().to_string())
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "registerCommand",
        function(lua, "plugin.registerCommand", move |_, args| {
            let decl = args.table(1, "command")?;
            let (Some(id), Some(title), Some(execute)) = (
                decl.string_field("id"),
                decl.string_field("title"),
                decl.callable_field("execute"),
            ) else {
                return Err(PluginError::InvalidArgument(
                    "plugin.registerCommand: expected { id = string, title = string, execute = function }"
                        .into(),
                ));
            };
            if id.is_empty() {
                return Err(PluginError::InvalidArgument(
                    "plugin.registerCommand: command id is empty".into(),
                ));
            }

            let replaced = s.handlers.borrow_mut().register_command(
                id.to_string(),
                title.to_string(),
                execute.clone(),
            );
            tracing::debug!(plugin = %s.plugin.name, command = %id, replaced, "command registered");
            Ok(())
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "on",
        function(lua, "plugin.on", move |_, args| {
            let event = match args.get(1) {
                Some(ScriptValue::String(name)) => name.clone(),
                _ => return Err(args.mismatch(1, "event", "string")),
            };
            let handler = args.callable(2, "handler")?;
            if !events::is_known_event(&event) {
                tracing::debug!(plugin = %s.plugin.name, event = %event, "handler registered for unknown event");
            }
            s.handlers.borrow_mut().register_event(event, handler);
            Ok(())
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "call",
        function(lua, "plugin.call", move |_, args| {
            let target = args.string(1, "plugin")?;
            let function_name = args.string(2, "function")?;
            let call_args = args.strings_from(3);
            Ok(dispatch::call_from_plugin(
                &s.registry,
                &s.plugin.name,
                &target,
                &function_name,
                &call_args,
            ))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "log",
        function(lua, "plugin.log", move |_, args| {
            let msg = sanitize_log_message(&args.string(1, "message")?);
            tracing::info!(plugin = %s.plugin.name, "{msg}");
            Ok(())
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "logError",
        function(lua, "plugin.logError", move |_, args| {
            let msg = sanitize_log_message(&args.string(1, "message")?);
            tracing::error!(plugin = %s.plugin.name, "{msg}");
            Ok(())
        })?,
    )?;

    Ok(table)
}

// ─── ui.* ───────────────────────────────────────────────────────────

fn ui_table(lua: &Lua, scope: &Rc<CapabilityScope>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let s = scope.clone();
    table.set(
        "message",
        function(lua, "ui.message", move |_, args| {
            let (title, message) = title_and_message(&args)?;
            s.host.ui().message(&title, &message);
            Ok(())
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "confirm",
        function(lua, "ui.confirm", move |_, args| {
            let (title, message) = title_and_message(&args)?;
            Ok(s.host.ui().confirm(&title, &message))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "input",
        function(lua, "ui.input", move |_, args| {
            let label = args.string(1, "label")?;
            let default = args.opt_string(2, "default")?.unwrap_or_default();
            Ok(ScriptValue::from(s.host.ui().input(&label, &default)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "select",
        function(lua, "ui.select", move |_, args| {
            let items: Vec<String> = args
                .table(1, "items")?
                .array
                .iter()
                .filter_map(ScriptValue::coerce_string)
                .collect();
            // Script indices are 1-based.
            let default_index = args
                .opt_integer(2, "default")?
                .map_or(0, |i| usize::try_from(i.saturating_sub(1)).unwrap_or(0));
            Ok(ScriptValue::from(s.host.ui().select(&items, default_index)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "getClipboard",
        function(lua, "ui.getClipboard", move |_, _| Ok(s.host.ui().clipboard()))?,
    )?;

    let s = scope.clone();
    table.set(
        "setClipboard",
        function(lua, "ui.setClipboard", move |_, args| {
            Ok(s.host.ui().set_clipboard(&args.string(1, "text")?))
        })?,
    )?;

    Ok(table)
}

/// `(title, message)`, or just `(message)` with an empty title.
fn title_and_message(args: &Arguments) -> Result<(String, String), PluginError> {
    match args.opt_string(2, "message")? {
        Some(message) => Ok((args.string(1, "title")?, message)),
        None => Ok((String::new(), args.string(1, "message")?)),
    }
}

// ─── fs.* ───────────────────────────────────────────────────────────

fn fs_table(lua: &Lua, scope: &Rc<CapabilityScope>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let s = scope.clone();
    table.set(
        "read",
        function(lua, "fs.read", move |_, args| {
            let path = s.resolve(&args.string(1, "path")?);
            Ok(s.host
                .fs()
                .read(&path)
                .map_or(ScriptValue::Absent, ScriptValue::from))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "write",
        function(lua, "fs.write", move |_, args| {
            let path = s.resolve(&args.string(1, "path")?);
            let contents = args.bytes(2, "contents")?;
            Ok(report_io(&s, "fs.write", &path, s.host.fs().write(&path, &contents)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "append",
        function(lua, "fs.append", move |_, args| {
            let path = s.resolve(&args.string(1, "path")?);
            let contents = args.bytes(2, "contents")?;
            Ok(report_io(&s, "fs.append", &path, s.host.fs().append(&path, &contents)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "exists",
        function(lua, "fs.exists", move |_, args| {
            Ok(s.host.fs().exists(&s.resolve(&args.string(1, "path")?)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "isFile",
        function(lua, "fs.isFile", move |_, args| {
            Ok(s.host.fs().is_file(&s.resolve(&args.string(1, "path")?)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "isDirectory",
        function(lua, "fs.isDirectory", move |_, args| {
            Ok(s.host.fs().is_dir(&s.resolve(&args.string(1, "path")?)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "mkdir",
        function(lua, "fs.mkdir", move |_, args| {
            let path = s.resolve(&args.string(1, "path")?);
            Ok(report_io(&s, "fs.mkdir", &path, s.host.fs().mkdir(&path)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "listdir",
        function(lua, "fs.listdir", move |_, args| {
            let path = s.resolve(&args.string(1, "path")?);
            Ok(match s.host.fs().list(&path) {
                Ok(names) => ScriptValue::Table(ScriptTable::from_strings(names)),
                Err(_) => ScriptValue::Absent,
            })
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "realpath",
        function(lua, "fs.realpath", move |_, args| {
            let path = s.resolve(&args.string(1, "path")?);
            Ok(s.host
                .fs()
                .canonical_path(&path)
                .map(|p| p.display().to_string())
                .unwrap_or_default())
        })?,
    )?;

    table.set(
        "basename",
        function(lua, "fs.basename", |_, args| {
            let path = args.string(1, "path")?;
            Ok(Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default())
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "dirname",
        function(lua, "fs.dirname", move |_, args| {
            let path = args.string(1, "path")?;
            let canonical_parent = s
                .host
                .fs()
                .canonical_path(&s.resolve(&path))
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf));
            Ok(match canonical_parent {
                Some(parent) => parent.display().to_string(),
                None => Path::new(&path)
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            })
        })?,
    )?;

    table.set(
        "join",
        function(lua, "fs.join", |_, args| {
            // Lexical: an absolute later part does not discard earlier ones.
            let parts: Vec<String> = (1..=args.len())
                .filter_map(|i| args.get(i).and_then(ScriptValue::coerce_string))
                .collect();
            Ok(parts.join(std::path::MAIN_SEPARATOR_STR))
        })?,
    )?;

    Ok(table)
}

/// Log a failed file operation and turn its result into a boolean.
fn report_io(scope: &CapabilityScope, op: &str, path: &Path, result: std::io::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(
                plugin = %scope.plugin.name,
                op,
                path = %path.display(),
                error = %e,
                "file operation failed"
            );
            false
        }
    }
}

// ─── settings.* ─────────────────────────────────────────────────────

fn settings_table(lua: &Lua, scope: &Rc<CapabilityScope>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let s = scope.clone();
    table.set(
        "get",
        function(lua, "settings.get", move |_, args| {
            let key = s.settings_key(&args.string(1, "key")?);
            Ok(ScriptValue::from(s.host.settings().get(&key)))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "set",
        function(lua, "settings.set", move |_, args| {
            let key = s.settings_key(&args.string(1, "key")?);
            let value = args.string(2, "value")?;
            Ok(s.host.settings().set(&key, &value))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "has",
        function(lua, "settings.has", move |_, args| {
            let key = s.settings_key(&args.string(1, "key")?);
            Ok(s.host.settings().has(&key))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "remove",
        function(lua, "settings.remove", move |_, args| {
            let key = s.settings_key(&args.string(1, "key")?);
            Ok(s.host.settings().remove(&key))
        })?,
    )?;

    Ok(table)
}

// ─── editor.* ───────────────────────────────────────────────────────

fn editor_table(lua: &Lua, scope: &Rc<CapabilityScope>) -> mlua::Result<Table> {
    let table = lua.create_table()?;

    let s = scope.clone();
    table.set(
        "currentFile",
        function(lua, "editor.currentFile", move |_, _| {
            Ok(ScriptValue::from(
                s.host
                    .editor()
                    .current_file()
                    .map(|p| p.display().to_string()),
            ))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "open",
        function(lua, "editor.open", move |_, args| {
            let path = PathBuf::from(args.string(1, "path")?);
            Ok(s.host.editor().open(&path))
        })?,
    )?;

    let s = scope.clone();
    table.set(
        "save",
        function(lua, "editor.save", move |_, _| Ok(s.host.editor().save()))?,
    )?;

    let s = scope.clone();
    table.set(
        "close",
        function(lua, "editor.close", move |_, args| {
            let path = args.opt_string(1, "path")?.map(PathBuf::from);
            Ok(s.host.editor().close(path.as_deref()))
        })?,
    )?;

    Ok(table)
}
