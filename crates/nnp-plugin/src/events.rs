//! Host events and their broadcast to plugins.

use serde::{Deserialize, Serialize};

use crate::dispatch::{self, Target};
use crate::error::PluginError;
use crate::registry::RegistryState;

/// Script names of every event the host emits.
pub const KNOWN_EVENTS: &[&str] = &[
    "ready",
    "shutdown",
    "beforeFileOpen",
    "afterFileOpen",
    "beforeFileSave",
    "afterFileSave",
    "beforeFileClose",
    "afterFileClose",
];

/// Check if an event name is one the host emits.
pub fn is_known_event(name: &str) -> bool {
    KNOWN_EVENTS.contains(&name)
}

/// A lifecycle or file event raised by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostEvent {
    Ready,
    Shutdown,
    BeforeFileOpen(String),
    AfterFileOpen(String),
    BeforeFileSave(String),
    AfterFileSave(String),
    BeforeFileClose(String),
    AfterFileClose(String),
}

impl HostEvent {
    /// Name plugins register handlers under.
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::Ready => "ready",
            HostEvent::Shutdown => "shutdown",
            HostEvent::BeforeFileOpen(_) => "beforeFileOpen",
            HostEvent::AfterFileOpen(_) => "afterFileOpen",
            HostEvent::BeforeFileSave(_) => "beforeFileSave",
            HostEvent::AfterFileSave(_) => "afterFileSave",
            HostEvent::BeforeFileClose(_) => "beforeFileClose",
            HostEvent::AfterFileClose(_) => "afterFileClose",
        }
    }

    /// The file argument of file events.
    pub fn filename(&self) -> Option<&str> {
        match self {
            HostEvent::Ready | HostEvent::Shutdown => None,
            HostEvent::BeforeFileOpen(f)
            | HostEvent::AfterFileOpen(f)
            | HostEvent::BeforeFileSave(f)
            | HostEvent::AfterFileSave(f)
            | HostEvent::BeforeFileClose(f)
            | HostEvent::AfterFileClose(f) => Some(f),
        }
    }

    /// Build an event from its script name. File events without a
    /// filename carry an empty one.
    pub fn parse(name: &str, filename: Option<&str>) -> Option<Self> {
        let file = || filename.unwrap_or_default().to_string();
        Some(match name {
            "ready" => HostEvent::Ready,
            "shutdown" => HostEvent::Shutdown,
            "beforeFileOpen" => HostEvent::BeforeFileOpen(file()),
            "afterFileOpen" => HostEvent::AfterFileOpen(file()),
            "beforeFileSave" => HostEvent::BeforeFileSave(file()),
            "afterFileSave" => HostEvent::AfterFileSave(file()),
            "beforeFileClose" => HostEvent::BeforeFileClose(file()),
            "afterFileClose" => HostEvent::AfterFileClose(file()),
            _ => return None,
        })
    }
}

/// Outcome of one broadcast, by plugin name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastSummary {
    pub delivered: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Deliver `event` to every loaded plugin in load order.
///
/// Disabled plugins, plugins without a handler and plugins that are
/// currently executing are skipped. A failing handler does not stop the
/// broadcast.
pub(crate) fn broadcast(state: &RegistryState, event: &HostEvent) -> BroadcastSummary {
    let name = event.name();
    let order: Vec<String> = state.load_order.borrow().clone();
    let mut summary = BroadcastSummary::default();

    for plugin in order {
        if state.active.borrow().contains(&plugin) {
            tracing::debug!(plugin = %plugin, event = %name, "plugin is executing, skipping");
            summary.skipped.push(plugin);
            continue;
        }

        let target = match dispatch::resolve(
            state,
            &plugin,
            |env| env.event_handler(name),
            || PluginError::FunctionNotFound(name.to_string()),
        ) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(plugin = %plugin, event = %name, "skipping: {e}");
                summary.skipped.push(plugin);
                continue;
            }
        };

        match deliver(state, &plugin, name, &target, event.filename()) {
            Ok(()) => summary.delivered.push(plugin),
            Err(e) => {
                tracing::warn!(plugin = %plugin, event = %name, "event handler failed: {e}");
                summary.failed.push(plugin);
            }
        }
    }

    tracing::debug!(
        event = %name,
        delivered = summary.delivered.len(),
        skipped = summary.skipped.len(),
        failed = summary.failed.len(),
        "event broadcast"
    );
    summary
}

fn deliver(
    state: &RegistryState,
    plugin: &str,
    name: &str,
    target: &Target,
    filename: Option<&str>,
) -> Result<(), PluginError> {
    match filename {
        Some(file) => dispatch::invoke::<_, ()>(state, plugin, name, target, file.to_string()),
        None => dispatch::invoke::<_, ()>(state, plugin, name, target, ()),
    }
}
