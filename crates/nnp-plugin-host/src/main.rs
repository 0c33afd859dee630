//! Headless plugin host.
//!
//! Loads a plugin directory, fires `ready`, runs the requested commands and
//! events, prints a report and finalizes the registry.
//!
//! Usage:
//!   nnp-plugin-host --plugins ./plugins --command wc.count --event afterFileSave:/tmp/a.txt

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use nnp_plugin::{
    BroadcastSummary, CommandInfo, HeadlessInteraction, HostEvent, HostHandle, JsonSettingsStore,
    PluginInfo, PluginRegistry, RegistryConfig,
};

#[derive(Parser)]
#[command(name = "nnp-plugin-host")]
#[command(about = "Run editor plugins without the editor", long_about = None)]
struct Args {
    /// Directory holding one sub-directory per plugin
    #[arg(short, long)]
    plugins: Option<PathBuf>,

    /// Directory for plugin config files and host settings
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Host version checked against plugin version ranges
    #[arg(long)]
    host_version: Option<String>,

    /// Command to run, as <plugin>.<command> (repeatable)
    #[arg(short, long = "command")]
    commands: Vec<String>,

    /// Event to broadcast, as <name>[:<file>] (repeatable)
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Answer every confirmation prompt with yes
    #[arg(short = 'y', long)]
    yes: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct CommandRun {
    id: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct EventRun {
    event: String,
    #[serde(flatten)]
    summary: BroadcastSummary,
}

#[derive(Serialize)]
struct Report {
    loaded: Vec<PluginInfo>,
    failed: BTreeMap<String, String>,
    commands: Vec<CommandInfo>,
    runs: Vec<CommandRun>,
    events: Vec<EventRun>,
}

fn parse_event(raw: &str) -> Result<HostEvent> {
    let (name, file) = match raw.split_once(':') {
        Some((name, file)) => (name, Some(file)),
        None => (raw, None),
    };
    HostEvent::parse(name, file).with_context(|| format!("unknown event '{name}'"))
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Parse events up front so a typo fails before any plugin runs.
    let events = args
        .events
        .iter()
        .map(|raw| parse_event(raw))
        .collect::<Result<Vec<_>>>()?;

    let mut config = RegistryConfig::from_env();
    if let Some(dir) = args.plugins {
        config.plugin_dir = dir;
    }
    if let Some(dir) = args.config_dir {
        config.config_dir = dir;
    }
    if let Some(version) = args.host_version {
        config.host_version = version;
    }

    let interaction = if args.yes {
        HeadlessInteraction::assume_yes()
    } else {
        HeadlessInteraction::default()
    };
    let host = HostHandle::headless()
        .with_interaction(interaction)
        .with_settings(JsonSettingsStore::open(config.config_dir.join("settings.json")));

    let plugin_dir = config.plugin_dir.clone();
    let registry = PluginRegistry::new(config);
    registry.initialize(host)?;

    let loaded = registry
        .load_plugins_from_directory(&plugin_dir)
        .with_context(|| format!("failed to scan {}", plugin_dir.display()))?;
    tracing::info!(dir = %plugin_dir.display(), loaded = loaded.len(), "plugins loaded");

    let mut report_events = vec![EventRun {
        event: "ready".into(),
        summary: registry.notify_ready(),
    }];

    let mut runs = Vec::new();
    for id in &args.commands {
        let result = registry.execute_command(id);
        if let Err(e) = &result {
            tracing::error!(command = %id, "command failed: {e}");
        }
        runs.push(CommandRun {
            id: id.clone(),
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        });
    }

    for event in &events {
        report_events.push(EventRun {
            event: event.name().to_string(),
            summary: registry.notify(event),
        });
    }

    let report = Report {
        loaded: registry
            .loaded_plugins()
            .iter()
            .filter_map(|name| registry.plugin_info(name))
            .collect(),
        failed: registry.failed_plugins(),
        commands: registry.commands(),
        runs,
        events: report_events,
    };

    registry.finalize()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let failures = report.runs.iter().filter(|r| !r.ok).count();
    if failures > 0 {
        bail!("{failures} command(s) failed");
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!("Loaded plugins ({}):", report.loaded.len());
    for info in &report.loaded {
        println!("  {} {} ({})", info.name, info.version, info.root_path.display());
        if let Some(err) = &info.last_error {
            println!("    last error: {err}");
        }
    }

    if !report.failed.is_empty() {
        println!("Failed plugins ({}):", report.failed.len());
        for (name, reason) in &report.failed {
            println!("  {name}: {reason}");
        }
    }

    if !report.commands.is_empty() {
        println!("Commands:");
        for command in &report.commands {
            let marker = if command.has_handler { "" } else { " (no handler)" };
            println!("  {}  {}{marker}", command.id, command.title);
        }
    }

    for run in &report.runs {
        match &run.error {
            None => println!("ran {}", run.id),
            Some(err) => println!("FAILED {}: {err}", run.id),
        }
    }

    for event in &report.events {
        println!(
            "{}: delivered {}, skipped {}, failed {}",
            event.event,
            event.summary.delivered.len(),
            event.summary.skipped.len(),
            event.summary.failed.len()
        );
    }
}
