//! Observer Agent: the tab-side half of the reconciliation protocol.
//!
//! One agent per conferencing tab. It finds the page's mute control, keeps a
//! cached copy of its mute flag, forwards real changes as confirmed reports,
//! and carries out toggle commands by pressing the page's own shortcut.
//!
//! ```text
//! Unattached ──scan──▶ Searching ──found──▶ Attached
//!     ▲                    │                   │
//!     └──────timeout───────┘◀──control gone────┘
//! ```
//!
//! A toggle is verified twice: a quick read that is only logged, then a
//! later final read that is reported as confirmed whatever it says.

use serde::Serialize;
use std::time::Duration;

use mutesync_protocol::{TabMessage, PORT_NAME};

use crate::config::MuteConfig;
use crate::platform::{BackgroundLink, PageDom};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttachState {
    Unattached,
    Searching {
        #[serde(skip)]
        started_at: Duration,
    },
    Attached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    /// Script load.
    Started,
    /// The control's mute attribute was mutated.
    AttributeChanged,
    /// The page body's class list changed (re-render hint).
    BodyClassChanged,
    ToggleCommand {
        muted: bool,
    },
    /// The background side closed the channel.
    PortDisconnected,
    PageUnload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverTask {
    PollForControl,
    QuickCheck,
    FinalCheck,
    Reconnect,
}

pub struct ObserverAgent {
    config: MuteConfig,
    page: Box<dyn PageDom>,
    link: Box<dyn BackgroundLink>,
    scheduler: Scheduler<ObserverTask>,
    attach: AttachState,
    muted: Option<bool>,
    connected: bool,
    reconnect_attempted: bool,
}

impl ObserverAgent {
    pub fn new(config: MuteConfig, page: Box<dyn PageDom>, link: Box<dyn BackgroundLink>) -> Self {
        Self {
            config,
            page,
            link,
            scheduler: Scheduler::new(),
            attach: AttachState::Unattached,
            muted: None,
            connected: false,
            reconnect_attempted: false,
        }
    }

    pub fn attach_state(&self) -> AttachState {
        self.attach
    }

    /// Last mute flag the agent believes the page is in.
    pub fn cached_muted(&self) -> Option<bool> {
        self.muted
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn handle_event(&mut self, event: ObserverEvent) {
        tracing::debug!(event = ?event, attach = ?self.attach, "Observer event");
        match event {
            ObserverEvent::Started => {
                self.connect();
                self.post(TabMessage::ContentScriptLoaded);
                self.begin_search();
            }
            ObserverEvent::AttributeChanged => self.attribute_changed(),
            ObserverEvent::BodyClassChanged => self.body_class_changed(),
            ObserverEvent::ToggleCommand { muted } => self.toggle(muted),
            ObserverEvent::PortDisconnected => self.port_disconnected(),
            ObserverEvent::PageUnload => self.unload(),
        }
    }

    fn connect(&mut self) -> bool {
        match self.link.connect(PORT_NAME) {
            Ok(()) => {
                self.connected = true;
                tracing::info!(port = PORT_NAME, "Connected to background");
                true
            }
            Err(err) => {
                self.connected = false;
                tracing::warn!(error = %err, "Failed to connect to background");
                false
            }
        }
    }

    fn post(&mut self, message: TabMessage) {
        if let Err(err) = self.link.post(&message) {
            tracing::warn!(message = ?message, error = %err, "Failed to post to background");
        }
    }

    fn read_flag(&self) -> Option<bool> {
        let raw = self
            .page
            .read_attribute(&self.config.page.mute_selector, &self.config.page.mute_attribute)?;
        match raw.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            other => {
                tracing::debug!(value = other, "Unrecognized mute attribute value");
                None
            }
        }
    }

    fn control_present(&self) -> bool {
        self.page.control_present(&self.config.page.mute_selector)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Attachment
    // ─────────────────────────────────────────────────────────────────────

    fn begin_search(&mut self) {
        if matches!(self.attach, AttachState::Searching { .. }) {
            return;
        }
        if self.control_present() {
            self.attach();
            return;
        }
        self.attach = AttachState::Searching {
            started_at: self.scheduler.now(),
        };
        self.scheduler
            .schedule(self.config.timing.poll_interval(), ObserverTask::PollForControl);
        tracing::debug!("Searching for mute control");
    }

    fn poll_for_control(&mut self) {
        let AttachState::Searching { started_at } = self.attach else {
            return;
        };
        if self.control_present() {
            self.attach();
            return;
        }

        let waited = self.scheduler.now().saturating_sub(started_at);
        if waited >= self.config.timing.search_timeout() {
            tracing::info!(waited_ms = waited.as_millis() as u64, "Mute control not found");
            self.attach = AttachState::Unattached;
            self.post(TabMessage::MuteButtonNotFound);
            self.post(TabMessage::Disconnected);
            return;
        }
        self.scheduler
            .schedule(self.config.timing.poll_interval(), ObserverTask::PollForControl);
    }

    fn attach(&mut self) {
        self.attach = AttachState::Attached;
        self.muted = self.read_flag();
        tracing::info!(muted = ?self.muted, "Attached to mute control");
        self.announce();
    }

    /// Tells the background side the control is here and what it shows.
    fn announce(&mut self) {
        self.post(TabMessage::MuteButtonFound);
        if let Some(muted) = self.muted {
            self.post(TabMessage::state_report(muted, true));
        }
    }

    fn body_class_changed(&mut self) {
        match self.attach {
            AttachState::Attached if !self.control_present() => {
                tracing::info!("Mute control disappeared");
                self.attach = AttachState::Unattached;
                self.muted = None;
                self.post(TabMessage::Disconnected);
                self.begin_search();
            }
            AttachState::Attached | AttachState::Searching { .. } => {}
            AttachState::Unattached => self.begin_search(),
        }
    }

    fn attribute_changed(&mut self) {
        if self.attach != AttachState::Attached {
            return;
        }
        let Some(muted) = self.read_flag() else {
            return;
        };
        if self.muted == Some(muted) {
            tracing::debug!(muted, "Attribute unchanged from cached flag");
            return;
        }
        self.muted = Some(muted);
        tracing::info!(muted, "Mute state changed on page");
        self.post(TabMessage::state_report(muted, true));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Toggle
    // ─────────────────────────────────────────────────────────────────────

    fn toggle(&mut self, requested: bool) {
        if self.attach != AttachState::Attached {
            tracing::warn!(requested, attach = ?self.attach, "Toggle received without mute control");
            if self.attach == AttachState::Unattached {
                self.begin_search();
            }
            return;
        }

        // Always press; the final check reports what actually landed.
        if self.muted == Some(requested) {
            tracing::debug!(requested, "Toggle requests the cached state; pressing anyway");
        }
        self.muted = Some(requested);
        let chord = self.config.page.shortcut.clone();
        if let Err(err) = self.page.dispatch_key(&chord) {
            tracing::warn!(shortcut = %chord, error = %err, "Failed to dispatch mute shortcut");
        }
        self.scheduler
            .schedule(self.config.timing.quick_check(), ObserverTask::QuickCheck);
    }

    fn quick_check(&mut self) {
        if self.attach != AttachState::Attached {
            return;
        }
        let reading = self.read_flag();
        tracing::debug!(reading = ?reading, expected = ?self.muted, "Quick check");
        self.scheduler
            .schedule(self.config.timing.final_check(), ObserverTask::FinalCheck);
    }

    fn final_check(&mut self) {
        if self.attach != AttachState::Attached {
            return;
        }
        match self.read_flag() {
            Some(muted) => {
                self.muted = Some(muted);
                tracing::info!(muted, "Final check");
                self.post(TabMessage::state_report(muted, true));
            }
            None => tracing::warn!("Final check could not read mute attribute"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Channel lifecycle
    // ─────────────────────────────────────────────────────────────────────

    fn port_disconnected(&mut self) {
        self.connected = false;
        if self.reconnect_attempted {
            tracing::warn!("Background channel lost again; not reconnecting");
            return;
        }
        self.reconnect_attempted = true;
        self.scheduler
            .schedule(self.config.timing.reconnect_delay(), ObserverTask::Reconnect);
        tracing::info!("Background channel lost; reconnect scheduled");
    }

    fn reconnect(&mut self) {
        if !self.connect() {
            return;
        }
        self.reconnect_attempted = false;
        self.post(TabMessage::ContentScriptLoaded);
        if self.attach == AttachState::Attached {
            self.announce();
        }
    }

    fn unload(&mut self) {
        let notice = TabMessage::Disconnected;
        let sent = if self.connected {
            self.link.post(&notice)
        } else {
            self.link.send_once(&notice)
        };
        if let Err(err) = sent {
            tracing::debug!(error = %err, "Unload notice not delivered");
        }
        self.scheduler.clear();
        self.attach = AttachState::Unattached;
        self.connected = false;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────

    pub fn run_due(&mut self, now: Duration) {
        while let Some(task) = self.scheduler.pop_due(now) {
            tracing::debug!(task = ?task, "Observer task due");
            match task {
                ObserverTask::PollForControl => self.poll_for_control(),
                ObserverTask::QuickCheck => self.quick_check(),
                ObserverTask::FinalCheck => self.final_check(),
                ObserverTask::Reconnect => self.reconnect(),
            }
        }
        self.scheduler.set_now(now);
    }

    pub fn advance(&mut self, by: Duration) {
        let target = self.scheduler.now() + by;
        self.run_due(target);
    }

    pub fn time_until_next_task(&self) -> Option<Duration> {
        self.scheduler.time_until_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLink, FakePage};

    fn agent(page: &FakePage, link: &FakeLink) -> ObserverAgent {
        ObserverAgent::new(
            MuteConfig::default(),
            Box::new(page.clone()),
            Box::new(link.clone()),
        )
    }

    fn started(page: &FakePage, link: &FakeLink) -> ObserverAgent {
        let mut agent = agent(page, link);
        agent.handle_event(ObserverEvent::Started);
        link.take_posted();
        agent
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn start_with_control_attaches_and_reports() {
        let page = FakePage::with_control(true);
        let link = FakeLink::default();
        let mut agent = agent(&page, &link);

        agent.handle_event(ObserverEvent::Started);

        assert_eq!(agent.attach_state(), AttachState::Attached);
        assert!(link.is_connected());
        assert_eq!(
            link.posted(),
            vec![
                TabMessage::ContentScriptLoaded,
                TabMessage::MuteButtonFound,
                TabMessage::Muted { final_state: true },
            ]
        );
    }

    #[test]
    fn external_flip_reports_once() {
        let page = FakePage::with_control(false);
        let link = FakeLink::default();
        let mut agent = started(&page, &link);

        page.set_muted(true);
        agent.handle_event(ObserverEvent::AttributeChanged);
        agent.handle_event(ObserverEvent::AttributeChanged);

        assert_eq!(link.take_posted(), vec![TabMessage::Muted { final_state: true }]);
        assert_eq!(agent.cached_muted(), Some(true));
    }

    #[test]
    fn final_check_wins_over_quick_check() {
        let page = FakePage::with_control(false);
        let link = FakeLink::default();
        let mut agent = started(&page, &link);

        agent.handle_event(ObserverEvent::ToggleCommand { muted: true });
        assert_eq!(page.key_presses(), 1);

        page.set_muted(true);
        agent.advance(ms(150));
        assert!(link.posted().is_empty());

        page.set_muted(false);
        agent.advance(ms(600));
        assert_eq!(link.take_posted(), vec![TabMessage::Unmuted { final_state: true }]);
        assert_eq!(agent.cached_muted(), Some(false));
    }

    #[test]
    fn attribute_echo_of_own_toggle_is_not_reported_early() {
        let page = FakePage::with_control(false);
        let link = FakeLink::default();
        let mut agent = started(&page, &link);

        agent.handle_event(ObserverEvent::ToggleCommand { muted: true });
        page.set_muted(true);
        agent.handle_event(ObserverEvent::AttributeChanged);
        assert!(link.posted().is_empty());

        agent.advance(ms(750));
        assert_eq!(link.take_posted(), vec![TabMessage::Muted { final_state: true }]);
    }

    #[test]
    fn toggle_presses_shortcut_even_when_cached_state_matches() {
        let page = FakePage::with_control(true);
        let link = FakeLink::default();
        let mut agent = started(&page, &link);

        agent.handle_event(ObserverEvent::ToggleCommand { muted: true });
        assert_eq!(page.key_presses(), 1);
        assert_eq!(agent.cached_muted(), Some(true));

        page.set_muted(false);
        agent.advance(ms(750));
        assert_eq!(link.take_posted(), vec![TabMessage::Unmuted { final_state: true }]);
    }

    #[test]
    fn search_finds_control_after_render() {
        let page = FakePage::default();
        let link = FakeLink::default();
        let mut agent = started(&page, &link);
        assert!(matches!(agent.attach_state(), AttachState::Searching { .. }));

        agent.advance(ms(500));
        page.set_muted(false);
        agent.advance(ms(500));

        assert_eq!(agent.attach_state(), AttachState::Attached);
        assert_eq!(
            link.take_posted(),
            vec![
                TabMessage::MuteButtonFound,
                TabMessage::Unmuted { final_state: true },
            ]
        );
    }

    #[test]
    fn search_timeout_reports_not_found_and_disconnected() {
        let page = FakePage::default();
        let link = FakeLink::default();
        let mut agent = started(&page, &link);

        agent.advance(ms(14_999));
        assert!(link.posted().is_empty());
        agent.advance(ms(1));

        assert_eq!(agent.attach_state(), AttachState::Unattached);
        assert_eq!(
            link.take_posted(),
            vec![TabMessage::MuteButtonNotFound, TabMessage::Disconnected]
        );
        assert_eq!(agent.time_until_next_task(), None);
    }

    #[test]
    fn control_removal_disconnects_and_searches_again() {
        let page = FakePage::with_control(false);
        let link = FakeLink::default();
        let mut agent = started(&page, &link);

        page.remove_control();
        agent.handle_event(ObserverEvent::BodyClassChanged);

        assert_eq!(link.take_posted(), vec![TabMessage::Disconnected]);
        assert!(matches!(agent.attach_state(), AttachState::Searching { .. }));

        page.set_muted(true);
        agent.advance(ms(500));
        assert_eq!(agent.attach_state(), AttachState::Attached);
    }

    #[test]
    fn toggle_while_unattached_rescans() {
        let page = FakePage::default();
        let link = FakeLink::default();
        let mut agent = started(&page, &link);
        agent.advance(ms(15_000));
        link.take_posted();

        page.set_muted(false);
        agent.handle_event(ObserverEvent::ToggleCommand { muted: true });

        assert_eq!(page.key_presses(), 0);
        assert_eq!(agent.attach_state(), AttachState::Attached);
    }

    #[test]
    fn reconnects_once_after_forced_disconnect() {
        let page = FakePage::with_control(true);
        let link = FakeLink::default();
        let mut agent = started(&page, &link);

        link.drop_connection();
        agent.handle_event(ObserverEvent::PortDisconnected);
        agent.advance(ms(999));
        assert_eq!(link.connects(), 1);
        agent.advance(ms(1));

        assert_eq!(link.connects(), 2);
        assert!(agent.is_connected());
        assert_eq!(
            link.take_posted(),
            vec![
                TabMessage::ContentScriptLoaded,
                TabMessage::MuteButtonFound,
                TabMessage::Muted { final_state: true },
            ]
        );
    }

    #[test]
    fn failed_reconnect_gives_up() {
        let page = FakePage::with_control(true);
        let link = FakeLink::default();
        let mut agent = started(&page, &link);

        link.drop_connection();
        link.fail_connect(true);
        agent.handle_event(ObserverEvent::PortDisconnected);
        agent.advance(ms(1_000));
        agent.handle_event(ObserverEvent::PortDisconnected);

        assert_eq!(agent.time_until_next_task(), None);
        assert_eq!(link.connects(), 2);
        assert!(!agent.is_connected());
    }

    #[test]
    fn unload_sends_best_effort_notice() {
        let page = FakePage::with_control(false);
        let link = FakeLink::default();
        let mut agent = started(&page, &link);
        agent.handle_event(ObserverEvent::ToggleCommand { muted: true });

        agent.handle_event(ObserverEvent::PageUnload);

        assert_eq!(link.take_posted(), vec![TabMessage::Disconnected]);
        assert_eq!(agent.time_until_next_task(), None);
    }

    #[test]
    fn unload_without_channel_uses_one_shot() {
        let page = FakePage::with_control(false);
        let link = FakeLink::default();
        link.fail_connect(true);
        let mut agent = agent(&page, &link);
        agent.handle_event(ObserverEvent::Started);

        agent.handle_event(ObserverEvent::PageUnload);
        assert_eq!(link.one_shot(), vec![TabMessage::Disconnected]);
    }
}
