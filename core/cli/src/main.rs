//! mutesync: command-line client for the mutesync daemon.
//!
//! ## Subcommands
//!
//! - `toggle`: Request a mute toggle, as the icon or a shortcut would
//! - `command`: Fire a registered keyboard command by name
//! - `status`: Show the badge, aggregate state and sessions
//! - `observe`: Run an observer agent against a simulated meeting tab

mod daemon_client;
mod logging;
mod observe;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use mutesync_core::{load_config, MuteConfig};
use mutesync_protocol::{TabId, ToggleSource};

#[derive(Parser)]
#[command(name = "mutesync")]
#[command(about = "Keep a meeting tab's microphone in sync with the mutesync badge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    Icon,
    Shortcut,
    Request,
}

impl From<SourceArg> for ToggleSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Icon => ToggleSource::Icon,
            SourceArg::Shortcut => ToggleSource::Shortcut,
            SourceArg::Request => ToggleSource::Request,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Toggle the microphone in every meeting tab
    Toggle {
        /// Where the request comes from (icon skips the optimistic badge)
        #[arg(long, value_enum, default_value_t = SourceArg::Icon)]
        source: SourceArg,
    },

    /// Fire a keyboard command by name (e.g. toggle-mute)
    Command {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Show the current badge, aggregate state and sessions
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },

    /// Run an observer agent against a simulated meeting tab
    Observe {
        #[arg(long)]
        tab_id: TabId,

        #[arg(long, default_value = "https://meet.google.com/abc-defg-hij")]
        url: String,

        /// Start with the microphone muted
        #[arg(long)]
        muted: bool,

        /// How long the page takes to apply the shortcut
        #[arg(long, default_value_t = 100)]
        lag_ms: u64,

        /// Remove and restore the mute control every N seconds
        #[arg(long)]
        flap_secs: Option<u64>,

        /// Close the tab after N seconds
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Config file (defaults to ~/.mutesync/config.toml)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Toggle { source } => daemon_client::toggle(source.into()).map(print_toggle),
        Commands::Command { name } => daemon_client::command(&name).map(print_toggle),
        Commands::Status { json } => daemon_client::health().and_then(|health| {
            daemon_client::state().map(|state| print_status(&health, &state, json))
        }),
        Commands::Observe {
            tab_id,
            url,
            muted,
            lag_ms,
            flap_secs,
            duration_secs,
            config,
        } => {
            let config = load_config(config).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "Failed to load config; using defaults");
                MuteConfig::default()
            });
            observe::run(observe::ObserveOptions {
                tab_id,
                url,
                muted,
                lag: Duration::from_millis(lag_ms),
                flap: flap_secs.map(Duration::from_secs),
                duration: duration_secs.map(Duration::from_secs),
                config,
            })
        }
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "mutesync command failed");
        eprintln!("mutesync: {}", err);
        std::process::exit(1);
    }
}

fn print_toggle(outcome: Value) {
    let requested = outcome["requested"].as_bool().unwrap_or(false);
    let delivered = outcome["delivered"].as_array().map_or(0, Vec::len);
    let fallback = outcome["fallback"].as_array().map_or(0, Vec::len);
    println!(
        "Requested {} ({} tab(s), {} via fallback)",
        if requested { "mute" } else { "unmute" },
        delivered,
        fallback
    );
    if outcome["warned"].as_bool().unwrap_or(false) {
        println!("No meeting tab found");
    }
}

fn print_status(health: &Value, state: &Value, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(state).unwrap_or_else(|_| state.to_string())
        );
        return;
    }

    println!(
        "Daemon:   {} (pid {}, v{})",
        health["status"].as_str().unwrap_or("unknown"),
        health["pid"],
        health["version"].as_str().unwrap_or("?")
    );
    println!("Badge:    {}", state["badge"].as_str().unwrap_or("unknown"));
    println!(
        "Muted:    {}",
        state["state"]["is_muted"].as_bool().unwrap_or(false)
    );
    let sessions = state["sessions"].as_array().cloned().unwrap_or_default();
    println!("Sessions: {}", sessions.len());
    for session in sessions {
        let last = match session["last_confirmed"].as_bool() {
            Some(true) => "muted",
            Some(false) => "on",
            None => "unconfirmed",
        };
        println!(
            "  tab {:<6} {:<12} since {}",
            session["tab_id"],
            last,
            session["connected_at"].as_str().unwrap_or("-")
        );
    }
    if let Some(detached) = state["detached_tabs"].as_array().filter(|tabs| !tabs.is_empty()) {
        println!("Detached: {:?}", detached);
    }
}
