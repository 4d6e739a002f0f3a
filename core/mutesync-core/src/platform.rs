//! Capabilities consumed from the host platform and the conferencing page.
//!
//! The background service and observer agent only ever talk to the outside
//! world through these traits. Every call returns a `Result`; callers log and
//! continue on failure (best-effort, at-most-once, no retry).

use serde_json::Value;

use mutesync_protocol::{BackgroundMessage, TabId, TabMessage};

use crate::config::KeyChord;
use crate::error::Result;
use crate::patterns::UrlPattern;

/// Small persistent key-value storage.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&mut self, key: &str, value: Value) -> Result<()>;
}

/// The extension's clickable icon.
pub trait BadgeSurface {
    fn set_text(&mut self, text: &str) -> Result<()>;
    fn set_background_color(&mut self, color: &str) -> Result<()>;
    fn set_title(&mut self, title: &str) -> Result<()>;
    /// Per-tab tooltip hint.
    fn set_tab_title(&mut self, tab_id: TabId, title: &str) -> Result<()>;
}

/// Background end of a live channel to one tab.
pub trait TabPort {
    fn tab_id(&self) -> TabId;
    fn post(&mut self, message: &BackgroundMessage) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub tab_id: TabId,
    pub url: String,
}

/// Tab querying and one-shot delivery, used when no channel exists.
pub trait TabDirectory {
    fn query_tabs(&self, patterns: &[UrlPattern]) -> Result<Vec<TabInfo>>;
    fn send_once(&mut self, tab_id: TabId, message: &BackgroundMessage) -> Result<()>;
}

/// The conferencing page as seen from the tab side.
pub trait PageDom {
    /// Whether an element matching `selector` is currently in the page.
    fn control_present(&self, selector: &str) -> bool;
    /// Raw attribute value of the first element matching `selector`.
    fn read_attribute(&self, selector: &str, attribute: &str) -> Option<String>;
    /// Dispatches a synthetic key press on the page.
    fn dispatch_key(&mut self, chord: &KeyChord) -> Result<()>;
}

/// Tab end of the channel to the background process.
pub trait BackgroundLink {
    /// Opens (or reopens) the named long-lived channel.
    fn connect(&mut self, port_name: &str) -> Result<()>;
    fn post(&mut self, message: &TabMessage) -> Result<()>;
    /// One-shot message outside the channel.
    fn send_once(&mut self, message: &TabMessage) -> Result<()>;
}
