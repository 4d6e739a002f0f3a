//! Error types for mutesync-core operations.
//!
//! Nothing in the background service or the observer agent propagates these
//! past an event handler: they are logged where detected and the caller falls
//! back to its next-best-known state.

use std::path::PathBuf;

use mutesync_protocol::TabId;

/// All errors that can occur in mutesync-core operations.
#[derive(Debug, thiserror::Error)]
pub enum MuteError {
    // ─────────────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Channel to tab {tab_id} is closed")]
    ChannelClosed { tab_id: TabId },

    #[error("Send to tab {tab_id} failed: {details}")]
    SendFailed { tab_id: TabId, details: String },

    #[error("No receiver for tab {0}")]
    NoReceiver(TabId),

    #[error("Background channel unavailable: {0}")]
    LinkUnavailable(String),

    // ─────────────────────────────────────────────────────────────────────
    // Platform Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage read failed: {0}")]
    StorageRead(String),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Badge update failed: {0}")]
    Badge(String),

    #[error("Tab query failed: {0}")]
    TabQuery(String),

    #[error("Page interaction failed: {0}")]
    Page(String),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid URL pattern {pattern}: {details}")]
    InvalidPattern { pattern: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using MuteError.
pub type Result<T> = std::result::Result<T, MuteError>;

impl From<MuteError> for String {
    fn from(err: MuteError) -> String {
        err.to_string()
    }
}
