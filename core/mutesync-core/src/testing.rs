//! In-memory platform doubles.
//!
//! Each double is a cheap handle over shared state: clone it, hand one copy to
//! the service or agent, keep the other to inspect effects and inject
//! failures. Single-threaded (`Rc<RefCell<..>>`), matching the
//! event-loop model the service runs under.

use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use mutesync_protocol::{BackgroundMessage, TabId, TabMessage};

use crate::config::KeyChord;
use crate::error::{MuteError, Result};
use crate::patterns::{matches_any, UrlPattern};
use crate::platform::{
    BackgroundLink, BadgeSurface, KeyValueStore, PageDom, TabDirectory, TabInfo, TabPort,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct StoreState {
    values: BTreeMap<String, Value>,
    fail_reads: bool,
    fail_writes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<StoreState>>,
}

impl MemoryStore {
    pub fn value(&self, key: &str) -> Option<Value> {
        self.state.borrow().values.get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: Value) {
        self.state.borrow_mut().values.insert(key.to_string(), value);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.borrow_mut().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let state = self.state.borrow();
        if state.fail_reads {
            return Err(MuteError::StorageRead("injected read failure".to_string()));
        }
        Ok(state.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_writes {
            return Err(MuteError::StorageWrite("injected write failure".to_string()));
        }
        state.values.insert(key.to_string(), value);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Badge
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct BadgeState {
    text: String,
    color: String,
    title: String,
    tab_titles: BTreeMap<TabId, String>,
    texts: Vec<String>,
    fail: bool,
}

/// Records what was painted on the icon.
#[derive(Debug, Clone, Default)]
pub struct BadgeRecorder {
    state: Rc<RefCell<BadgeState>>,
}

impl BadgeRecorder {
    pub fn text(&self) -> String {
        self.state.borrow().text.clone()
    }

    pub fn color(&self) -> String {
        self.state.borrow().color.clone()
    }

    pub fn title(&self) -> String {
        self.state.borrow().title.clone()
    }

    pub fn tab_title(&self, tab_id: TabId) -> Option<String> {
        self.state.borrow().tab_titles.get(&tab_id).cloned()
    }

    /// Every text ever set, oldest first.
    pub fn text_history(&self) -> Vec<String> {
        self.state.borrow().texts.clone()
    }

    pub fn clear_history(&self) {
        self.state.borrow_mut().texts.clear();
    }

    pub fn fail(&self, fail: bool) {
        self.state.borrow_mut().fail = fail;
    }

    fn check(&self) -> Result<()> {
        if self.state.borrow().fail {
            return Err(MuteError::Badge("injected badge failure".to_string()));
        }
        Ok(())
    }
}

impl BadgeSurface for BadgeRecorder {
    fn set_text(&mut self, text: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        state.text = text.to_string();
        state.texts.push(text.to_string());
        Ok(())
    }

    fn set_background_color(&mut self, color: &str) -> Result<()> {
        self.check()?;
        self.state.borrow_mut().color = color.to_string();
        Ok(())
    }

    fn set_title(&mut self, title: &str) -> Result<()> {
        self.check()?;
        self.state.borrow_mut().title = title.to_string();
        Ok(())
    }

    fn set_tab_title(&mut self, tab_id: TabId, title: &str) -> Result<()> {
        self.check()?;
        self.state
            .borrow_mut()
            .tab_titles
            .insert(tab_id, title.to_string());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tab ports and directory
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct PortState {
    sent: Vec<BackgroundMessage>,
    closed: bool,
}

/// Background end of a fake channel.
#[derive(Debug)]
pub struct FakePort {
    tab_id: TabId,
    state: Rc<RefCell<PortState>>,
}

/// Test-side view of a [`FakePort`].
#[derive(Debug, Clone)]
pub struct PortHandle {
    state: Rc<RefCell<PortState>>,
}

impl FakePort {
    pub fn new(tab_id: TabId) -> (Self, PortHandle) {
        let state = Rc::new(RefCell::new(PortState::default()));
        (
            Self {
                tab_id,
                state: Rc::clone(&state),
            },
            PortHandle { state },
        )
    }
}

impl TabPort for FakePort {
    fn tab_id(&self) -> TabId {
        self.tab_id
    }

    fn post(&mut self, message: &BackgroundMessage) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(MuteError::ChannelClosed {
                tab_id: self.tab_id,
            });
        }
        state.sent.push(message.clone());
        Ok(())
    }
}

impl PortHandle {
    pub fn sent(&self) -> Vec<BackgroundMessage> {
        self.state.borrow().sent.clone()
    }

    /// Makes every later post fail, as if the tab went away.
    pub fn close(&self) {
        self.state.borrow_mut().closed = true;
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    tabs: Vec<TabInfo>,
    unreachable: BTreeSet<TabId>,
    sent: Vec<(TabId, BackgroundMessage)>,
    queries: usize,
    fail_queries: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeTabs {
    state: Rc<RefCell<DirectoryState>>,
}

impl FakeTabs {
    pub fn add_tab(&self, tab_id: TabId, url: &str) {
        self.state.borrow_mut().tabs.push(TabInfo {
            tab_id,
            url: url.to_string(),
        });
    }

    pub fn make_unreachable(&self, tab_id: TabId) {
        self.state.borrow_mut().unreachable.insert(tab_id);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.borrow_mut().fail_queries = fail;
    }

    pub fn queries(&self) -> usize {
        self.state.borrow().queries
    }

    pub fn sent(&self) -> Vec<(TabId, BackgroundMessage)> {
        self.state.borrow().sent.clone()
    }
}

impl TabDirectory for FakeTabs {
    fn query_tabs(&self, patterns: &[UrlPattern]) -> Result<Vec<TabInfo>> {
        let mut state = self.state.borrow_mut();
        state.queries += 1;
        if state.fail_queries {
            return Err(MuteError::TabQuery("injected query failure".to_string()));
        }
        Ok(state
            .tabs
            .iter()
            .filter(|tab| matches_any(patterns, &tab.url))
            .cloned()
            .collect())
    }

    fn send_once(&mut self, tab_id: TabId, message: &BackgroundMessage) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.unreachable.contains(&tab_id) {
            return Err(MuteError::NoReceiver(tab_id));
        }
        state.sent.push((tab_id, message.clone()));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Page and background link (tab side)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct PageState {
    present: bool,
    attribute: Option<String>,
    keys: Vec<KeyChord>,
    fail_keys: bool,
}

/// A page with a single mute control, matched by any selector.
#[derive(Debug, Clone, Default)]
pub struct FakePage {
    state: Rc<RefCell<PageState>>,
}

impl FakePage {
    pub fn with_control(muted: bool) -> Self {
        let page = Self::default();
        page.set_muted(muted);
        page
    }

    /// Puts the control on the page (if absent) with the given flag.
    pub fn set_muted(&self, muted: bool) {
        let mut state = self.state.borrow_mut();
        state.present = true;
        state.attribute = Some(muted.to_string());
    }

    pub fn set_attribute(&self, raw: Option<&str>) {
        self.state.borrow_mut().attribute = raw.map(str::to_string);
    }

    pub fn remove_control(&self) {
        let mut state = self.state.borrow_mut();
        state.present = false;
        state.attribute = None;
    }

    pub fn key_presses(&self) -> usize {
        self.state.borrow().keys.len()
    }

    pub fn fail_keys(&self, fail: bool) {
        self.state.borrow_mut().fail_keys = fail;
    }
}

impl PageDom for FakePage {
    fn control_present(&self, _selector: &str) -> bool {
        self.state.borrow().present
    }

    fn read_attribute(&self, _selector: &str, _attribute: &str) -> Option<String> {
        let state = self.state.borrow();
        if !state.present {
            return None;
        }
        state.attribute.clone()
    }

    fn dispatch_key(&mut self, chord: &KeyChord) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_keys {
            return Err(MuteError::Page("injected key dispatch failure".to_string()));
        }
        state.keys.push(chord.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    connects: usize,
    posted: Vec<TabMessage>,
    one_shot: Vec<TabMessage>,
    fail_connect: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    state: Rc<RefCell<LinkState>>,
}

impl FakeLink {
    /// Messages posted on the channel since the last call.
    pub fn take_posted(&self) -> Vec<TabMessage> {
        std::mem::take(&mut self.state.borrow_mut().posted)
    }

    pub fn posted(&self) -> Vec<TabMessage> {
        self.state.borrow().posted.clone()
    }

    pub fn one_shot(&self) -> Vec<TabMessage> {
        self.state.borrow().one_shot.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.borrow().connects
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// Severs the channel from the background side.
    pub fn drop_connection(&self) {
        self.state.borrow_mut().connected = false;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.borrow_mut().fail_connect = fail;
    }
}

impl BackgroundLink for FakeLink {
    fn connect(&mut self, _port_name: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.connects += 1;
        if state.fail_connect {
            return Err(MuteError::LinkUnavailable(
                "injected connect failure".to_string(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    fn post(&mut self, message: &TabMessage) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return Err(MuteError::LinkUnavailable("channel is closed".to_string()));
        }
        state.posted.push(message.clone());
        Ok(())
    }

    fn send_once(&mut self, message: &TabMessage) -> Result<()> {
        self.state.borrow_mut().one_shot.push(message.clone());
        Ok(())
    }
}
