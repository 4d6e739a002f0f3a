//! Runtime configuration.
//!
//! Loaded from `~/.mutesync/config.toml` when present. Every field has a
//! default so a partial (or missing) file is always usable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MuteError, Result};
use crate::patterns::UrlPattern;
use crate::storage::StorageConfig;

pub const DEFAULT_URL_PATTERN: &str = "https://meet.google.com/*-*-*";
pub const DEFAULT_MUTE_SELECTOR: &str = "div[role=\"button\"][data-is-muted]";
pub const DEFAULT_MUTE_ATTRIBUTE: &str = "data-is-muted";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MuteConfig {
    pub page: PageConfig,
    pub timing: TimingConfig,
}

/// How to find and drive the conferencing page's mute control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PageConfig {
    pub url_patterns: Vec<String>,
    pub mute_selector: String,
    pub mute_attribute: String,
    pub shortcut: KeyChord,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            url_patterns: vec![DEFAULT_URL_PATTERN.to_string()],
            mute_selector: DEFAULT_MUTE_SELECTOR.to_string(),
            mute_attribute: DEFAULT_MUTE_ATTRIBUTE.to_string(),
            shortcut: KeyChord::default(),
        }
    }
}

impl PageConfig {
    /// Compiles the configured URL patterns, skipping (and logging) bad ones.
    pub fn compiled_patterns(&self) -> Vec<UrlPattern> {
        self.url_patterns
            .iter()
            .filter_map(|raw| match UrlPattern::parse(raw) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    tracing::warn!(error = %err, "Ignoring invalid URL pattern");
                    None
                }
            })
            .collect()
    }
}

/// Key combination replicating the page's native mute shortcut.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeyChord {
    pub key: String,
    pub code: String,
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
    pub alt: bool,
}

impl Default for KeyChord {
    fn default() -> Self {
        Self {
            key: "d".to_string(),
            code: "KeyD".to_string(),
            ctrl: true,
            meta: false,
            shift: false,
            alt: false,
        }
    }
}

impl std::fmt::Display for KeyChord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modifiers = [
            (self.ctrl, "Ctrl"),
            (self.meta, "Meta"),
            (self.alt, "Alt"),
            (self.shift, "Shift"),
        ];
        for (enabled, name) in modifiers {
            if enabled {
                write!(f, "{}+", name)?;
            }
        }
        write!(f, "{}", self.key.to_uppercase())
    }
}

/// Delays used by the reconciliation protocol and the observer agent, in
/// milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    /// Safety-net repaint after a direct UI toggle.
    pub ui_recheck_ms: u64,
    /// Safety-net repaint after any other toggle.
    pub command_recheck_ms: u64,
    /// How long the "no active session" warning stays up.
    pub warning_ms: u64,
    /// Toggle to quick check.
    pub quick_check_ms: u64,
    /// Quick check to final check.
    pub final_check_ms: u64,
    pub poll_interval_ms: u64,
    pub search_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ui_recheck_ms: 300,
            command_recheck_ms: 1000,
            warning_ms: 2000,
            quick_check_ms: 150,
            final_check_ms: 600,
            poll_interval_ms: 500,
            search_timeout_ms: 15_000,
            reconnect_delay_ms: 1000,
        }
    }
}

impl TimingConfig {
    pub fn recheck_delay(&self, direct_ui: bool) -> Duration {
        if direct_ui {
            Duration::from_millis(self.ui_recheck_ms)
        } else {
            Duration::from_millis(self.command_recheck_ms)
        }
    }

    pub fn warning(&self) -> Duration {
        Duration::from_millis(self.warning_ms)
    }

    pub fn quick_check(&self) -> Duration {
        Duration::from_millis(self.quick_check_ms)
    }

    pub fn final_check(&self) -> Duration {
        Duration::from_millis(self.final_check_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Loads configuration from `path`, or from the default location.
///
/// A missing file yields defaults; a malformed one is an error so callers can
/// decide whether to log and fall back.
pub fn load_config(path: Option<PathBuf>) -> Result<MuteConfig> {
    let config_path = match path {
        Some(path) => path,
        None => StorageConfig::resolve()?.config_path(),
    };
    load_config_from(&config_path)
}

fn load_config_from(config_path: &Path) -> Result<MuteConfig> {
    if !config_path.exists() {
        return Ok(MuteConfig::default());
    }

    let content = fs_err::read_to_string(config_path).map_err(|source| MuteError::Io {
        context: format!("reading {}", config_path.display()),
        source,
    })?;
    toml::from_str::<MuteConfig>(&content).map_err(|err| MuteError::ConfigMalformed {
        path: config_path.to_path_buf(),
        details: err.to_string(),
    })
}
