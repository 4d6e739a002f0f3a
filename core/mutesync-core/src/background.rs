//! Background service: the single coordinator on the background side.
//!
//! Owns the session registry, the Local Preference, the badge and the
//! delayed-task scheduler. Everything that happens to it arrives as a
//! [`BackgroundEvent`] through [`BackgroundService::handle_event`] or as a due
//! [`BackgroundTask`] through [`BackgroundService::run_due`]; one event is
//! processed at a time.
//!
//! ## Toggle sequence
//!
//! ```text
//! read preference ─▶ requested = !current ─▶ persist requested (optimistic)
//!   ─▶ optimistic paint (non-direct sources only)
//!   ─▶ broadcast toggle_mute{requested} (fallback to tab query when empty)
//!   ─▶ after recheck delay: repaint from the persisted preference
//! ```
//!
//! Only confirmed (`final_state`) reports from tabs change the aggregate
//! state. The delayed repaint is a safety net for tabs that never answer.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use mutesync_protocol::{
    BackgroundMessage, Response, TabId, TabMessage, ToggleSource, TOGGLE_COMMAND,
};

use crate::badge::{self, BadgeAppearance};
use crate::config::MuteConfig;
use crate::patterns::UrlPattern;
use crate::platform::{BadgeSurface, KeyValueStore, TabDirectory, TabPort};
use crate::preference::LocalPreference;
use crate::registry::{AggregateMuteState, BroadcastOutcome, SessionInfo, SessionRegistry};
use crate::scheduler::{Scheduler, TaskId};

/// Everything the background side reacts to.
pub enum BackgroundEvent {
    /// Direct UI action on the extension icon.
    IconClicked,
    /// Registered keyboard shortcut, by command name.
    Command(String),
    /// Toggle requested by a message from elsewhere in the extension.
    ToggleRequested,
    PortConnected {
        tab_id: TabId,
        port: Box<dyn TabPort>,
    },
    PortMessage {
        tab_id: TabId,
        message: TabMessage,
    },
    PortDisconnected {
        tab_id: TabId,
    },
    TabRemoved {
        tab_id: TabId,
    },
}

impl std::fmt::Debug for BackgroundEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackgroundEvent::IconClicked => write!(f, "IconClicked"),
            BackgroundEvent::Command(name) => write!(f, "Command({})", name),
            BackgroundEvent::ToggleRequested => write!(f, "ToggleRequested"),
            BackgroundEvent::PortConnected { tab_id, .. } => {
                write!(f, "PortConnected {{ tab_id: {} }}", tab_id)
            }
            BackgroundEvent::PortMessage { tab_id, message } => {
                write!(f, "PortMessage {{ tab_id: {}, message: {:?} }}", tab_id, message)
            }
            BackgroundEvent::PortDisconnected { tab_id } => {
                write!(f, "PortDisconnected {{ tab_id: {} }}", tab_id)
            }
            BackgroundEvent::TabRemoved { tab_id } => write!(f, "TabRemoved {{ tab_id: {} }}", tab_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    SafetyNetRepaint,
    ClearWarning,
}

/// What a toggle request did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToggleOutcome {
    pub requested: bool,
    pub source: ToggleSource,
    pub delivered: Vec<TabId>,
    pub dropped: Vec<TabId>,
    /// Tabs reached through the one-shot fallback.
    pub fallback: Vec<TabId>,
    pub warned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundSnapshot {
    pub state: AggregateMuteState,
    pub badge: BadgeAppearance,
    pub preference: Option<bool>,
    pub sessions: Vec<SessionInfo>,
    pub detached_tabs: Vec<TabId>,
    pub warning_active: bool,
}

pub struct BackgroundService {
    config: MuteConfig,
    /// Compiled once from `config.page.url_patterns`; invalid entries are skipped.
    url_patterns: Vec<UrlPattern>,
    registry: SessionRegistry,
    /// Channels of tabs that reported "disconnected" but are still open.
    detached: BTreeMap<TabId, Box<dyn TabPort>>,
    preference: LocalPreference,
    badge: Box<dyn BadgeSurface>,
    tabs: Box<dyn TabDirectory>,
    scheduler: Scheduler<BackgroundTask>,
    warning_task: Option<TaskId>,
    painted: BadgeAppearance,
}

impl BackgroundService {
    pub fn new(
        config: MuteConfig,
        store: Box<dyn KeyValueStore>,
        badge: Box<dyn BadgeSurface>,
        tabs: Box<dyn TabDirectory>,
    ) -> Self {
        let preference = LocalPreference::new(store);
        let initial_muted = preference.muted_or_default();
        let url_patterns = config.page.compiled_patterns();
        let mut service = Self {
            config,
            url_patterns,
            registry: SessionRegistry::new(initial_muted),
            detached: BTreeMap::new(),
            preference,
            badge,
            tabs,
            scheduler: Scheduler::new(),
            warning_task: None,
            painted: BadgeAppearance::Disconnected,
        };
        service.paint(BadgeAppearance::Disconnected);
        tracing::info!(initial_muted, "Background service started");
        service
    }

    /// Single routing function for every background event.
    pub fn handle_event(&mut self, event: BackgroundEvent) {
        tracing::debug!(event = ?event, "Background event");
        match event {
            BackgroundEvent::IconClicked => {
                self.toggle(ToggleSource::Icon);
            }
            BackgroundEvent::Command(name) => {
                self.command(&name);
            }
            BackgroundEvent::ToggleRequested => {
                self.toggle(ToggleSource::Request);
            }
            BackgroundEvent::PortConnected { tab_id, port } => self.connect(tab_id, port),
            BackgroundEvent::PortMessage { tab_id, message } => {
                self.handle_tab_message(tab_id, message)
            }
            BackgroundEvent::PortDisconnected { tab_id } | BackgroundEvent::TabRemoved { tab_id } => {
                self.remove_tab(tab_id)
            }
        }
    }

    /// Dispatches a registered keyboard command. Unknown names are ignored.
    pub fn command(&mut self, name: &str) -> Option<ToggleOutcome> {
        if name == TOGGLE_COMMAND {
            Some(self.toggle(ToggleSource::Shortcut))
        } else {
            tracing::warn!(command = %name, "Ignoring unknown command");
            None
        }
    }

    /// Runs the toggle sequence. Never fails: every step is best-effort.
    pub fn toggle(&mut self, source: ToggleSource) -> ToggleOutcome {
        let current = self.preference.muted_or_default();
        let requested = !current;

        if let Err(err) = self.preference.set_muted(requested) {
            tracing::warn!(error = %err, requested, "Failed to persist requested mute state");
        }

        tracing::info!(
            source = source.as_str(),
            requested,
            sessions = self.registry.len(),
            "Toggle requested"
        );

        // Direct UI actions wait for confirmation to avoid flicker.
        if !source.is_direct_ui() && !self.registry.is_empty() {
            self.paint_state_now(AggregateMuteState {
                is_muted: requested,
                has_active_session: true,
            });
        }

        let message = BackgroundMessage::ToggleMute { muted: requested };
        let (outcome, fallback) = self.broadcast(&message);

        let warned = outcome.delivered.is_empty() && fallback.is_empty();
        if warned {
            tracing::warn!(requested, "Toggle reached no tab");
            self.show_no_session_warning();
        }

        self.scheduler.schedule(
            self.config.timing.recheck_delay(source.is_direct_ui()),
            BackgroundTask::SafetyNetRepaint,
        );

        ToggleOutcome {
            requested,
            source,
            delivered: outcome.delivered,
            dropped: outcome.dropped,
            fallback,
            warned,
        }
    }

    /// Sends to every session, or to matching tabs one-shot when there is
    /// none. Returns the registry outcome and the tabs reached by fallback.
    fn broadcast(&mut self, message: &BackgroundMessage) -> (BroadcastOutcome, Vec<TabId>) {
        if self.registry.is_empty() {
            return (BroadcastOutcome::default(), self.fallback_broadcast(message));
        }

        let outcome = self.registry.broadcast(message);
        if !outcome.dropped.is_empty() && self.registry.is_empty() {
            self.paint_state();
        }
        (outcome, Vec::new())
    }

    fn fallback_broadcast(&mut self, message: &BackgroundMessage) -> Vec<TabId> {
        let tabs = match self.tabs.query_tabs(&self.url_patterns) {
            Ok(tabs) => tabs,
            Err(err) => {
                tracing::warn!(error = %err, "Fallback tab query failed");
                return Vec::new();
            }
        };

        tracing::debug!(tabs = tabs.len(), "Fallback broadcast");
        let mut reached = Vec::new();
        for tab in tabs {
            match self.tabs.send_once(tab.tab_id, message) {
                Ok(()) => reached.push(tab.tab_id),
                Err(err) => {
                    tracing::warn!(tab_id = tab.tab_id, error = %err, "Fallback send failed");
                }
            }
        }
        reached
    }

    /// Handles a one-shot message from a tab, answering with a response
    /// object instead of failing.
    pub fn handle_one_shot(
        &mut self,
        id: Option<String>,
        tab_id: TabId,
        message: TabMessage,
    ) -> Response {
        let is_final_report = matches!(message.reported_state(), Some((_, true)));
        if is_final_report && !self.registry.contains(tab_id) && !self.detached.contains_key(&tab_id)
        {
            tracing::warn!(tab_id, message = ?message, "Confirmed report from tab without a channel");
            return Response::error(
                id,
                "no_session",
                format!("tab {} has no open channel", tab_id),
            );
        }

        self.handle_tab_message(tab_id, message);
        Response::ok(
            id,
            json!({"accepted": true, "sessions": self.registry.len()}),
        )
    }

    fn connect(&mut self, tab_id: TabId, port: Box<dyn TabPort>) {
        self.detached.remove(&tab_id);
        self.registry.register(tab_id, port);
        badge::mark_tab_connected(self.badge.as_mut(), tab_id);
        self.paint_state();
    }

    fn handle_tab_message(&mut self, tab_id: TabId, message: TabMessage) {
        match message {
            TabMessage::ContentScriptLoaded => {
                tracing::debug!(tab_id, "Content script loaded");
            }
            TabMessage::Muted { final_state } | TabMessage::Unmuted { final_state }
                if !final_state =>
            {
                tracing::debug!(tab_id, message = ?message, "Ignoring unconfirmed report");
            }
            TabMessage::Muted { .. } | TabMessage::Unmuted { .. } => {
                let muted = matches!(message, TabMessage::Muted { .. });
                self.reattach(tab_id);
                if self.registry.contains(tab_id) {
                    self.registry.report_final(tab_id, muted);
                    tracing::info!(tab_id, muted, "Confirmed mute state");
                    self.paint_state();
                } else {
                    tracing::warn!(tab_id, muted, "Confirmed report from unknown tab ignored");
                }
            }
            TabMessage::Disconnected => {
                if !self.registry.contains(tab_id) {
                    tracing::debug!(tab_id, "Disconnected report from tab without session");
                    return;
                }
                if let Some(port) = self.registry.report_disconnected(tab_id) {
                    self.detached.insert(tab_id, port);
                }
                if !self.registry.state().has_active_session {
                    self.paint_state();
                }
            }
            TabMessage::MuteButtonFound => {
                tracing::info!(tab_id, "Mute control found");
                self.reattach(tab_id);
            }
            TabMessage::MuteButtonNotFound => {
                tracing::info!(tab_id, "Mute control not found");
            }
        }
    }

    /// Re-registers a detached tab whose channel is still open.
    fn reattach(&mut self, tab_id: TabId) {
        if let Some(port) = self.detached.remove(&tab_id) {
            tracing::info!(tab_id, "Reattaching detached session");
            self.registry.register(tab_id, port);
            badge::mark_tab_connected(self.badge.as_mut(), tab_id);
            self.paint_state();
        }
    }

    fn remove_tab(&mut self, tab_id: TabId) {
        self.detached.remove(&tab_id);
        if self.registry.unregister(tab_id).is_some() && self.registry.is_empty() {
            self.paint_state();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────

    /// Runs every task due at or before `now` (scheduler clock).
    pub fn run_due(&mut self, now: Duration) {
        while let Some(task) = self.scheduler.pop_due(now) {
            self.run_task(task);
        }
        self.scheduler.set_now(now);
    }

    /// Moves the clock forward by `by`, running whatever falls due.
    pub fn advance(&mut self, by: Duration) {
        let target = self.scheduler.now() + by;
        self.run_due(target);
    }

    pub fn time_until_next_task(&self) -> Option<Duration> {
        self.scheduler.time_until_next()
    }

    fn run_task(&mut self, task: BackgroundTask) {
        tracing::debug!(task = ?task, "Background task due");
        match task {
            BackgroundTask::SafetyNetRepaint => {
                if self.warning_task.is_some() {
                    tracing::debug!("Skipping safety-net repaint while warning is shown");
                    return;
                }
                let muted = self.preference.muted_or_default();
                self.paint_state_now(AggregateMuteState {
                    is_muted: muted,
                    has_active_session: self.registry.state().has_active_session,
                });
            }
            BackgroundTask::ClearWarning => {
                self.warning_task = None;
                self.paint_state();
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Badge
    // ─────────────────────────────────────────────────────────────────────

    fn show_no_session_warning(&mut self) {
        if let Some(id) = self.warning_task.take() {
            self.scheduler.cancel(id);
        }
        self.paint(BadgeAppearance::NoSessionWarning);
        let id = self
            .scheduler
            .schedule(self.config.timing.warning(), BackgroundTask::ClearWarning);
        self.warning_task = Some(id);
    }

    /// Paints the aggregate state, ending any pending warning early.
    fn paint_state(&mut self) {
        if let Some(id) = self.warning_task.take() {
            self.scheduler.cancel(id);
        }
        self.paint(BadgeAppearance::for_state(self.registry.state()));
    }

    fn paint_state_now(&mut self, state: AggregateMuteState) {
        self.paint(BadgeAppearance::for_state(state));
    }

    fn paint(&mut self, appearance: BadgeAppearance) {
        badge::paint(self.badge.as_mut(), appearance);
        self.painted = appearance;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> AggregateMuteState {
        self.registry.state()
    }

    pub fn badge_appearance(&self) -> BadgeAppearance {
        self.painted
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn snapshot(&self) -> BackgroundSnapshot {
        let preference = match self.preference.muted() {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read mute preference for snapshot");
                None
            }
        };
        BackgroundSnapshot {
            state: self.registry.state(),
            badge: self.painted,
            preference,
            sessions: self.registry.sessions(),
            detached_tabs: self.detached.keys().copied().collect(),
            warning_active: self.warning_task.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preference::MUTED_KEY;
    use crate::testing::{BadgeRecorder, FakePort, FakeTabs, MemoryStore, PortHandle};

    struct Harness {
        service: BackgroundService,
        store: MemoryStore,
        badge: BadgeRecorder,
        tabs: FakeTabs,
    }

    fn harness() -> Harness {
        let store = MemoryStore::default();
        let badge = BadgeRecorder::default();
        let tabs = FakeTabs::default();
        let service = BackgroundService::new(
            MuteConfig::default(),
            Box::new(store.clone()),
            Box::new(badge.clone()),
            Box::new(tabs.clone()),
        );
        Harness {
            service,
            store,
            badge,
            tabs,
        }
    }

    fn connect(service: &mut BackgroundService, tab_id: TabId) -> PortHandle {
        let (port, handle) = FakePort::new(tab_id);
        service.handle_event(BackgroundEvent::PortConnected {
            tab_id,
            port: Box::new(port),
        });
        handle
    }

    fn report(service: &mut BackgroundService, tab_id: TabId, muted: bool) {
        service.handle_event(BackgroundEvent::PortMessage {
            tab_id,
            message: TabMessage::state_report(muted, true),
        });
    }

    #[test]
    fn starts_disconnected_with_preference_seeded() {
        let store = MemoryStore::default();
        store.insert(MUTED_KEY, json!(true));
        let badge = BadgeRecorder::default();
        let service = BackgroundService::new(
            MuteConfig::default(),
            Box::new(store),
            Box::new(badge.clone()),
            Box::new(FakeTabs::default()),
        );

        assert_eq!(
            service.state(),
            AggregateMuteState {
                is_muted: true,
                has_active_session: false,
            }
        );
        assert_eq!(badge.text(), BadgeAppearance::Disconnected.text());
    }

    #[test]
    fn connect_marks_tab_hint() {
        let mut h = harness();
        connect(&mut h.service, 3);
        assert_eq!(
            h.badge.tab_title(3).as_deref(),
            Some(badge::CONNECTED_TAB_HINT)
        );
        assert!(h.service.state().has_active_session);
    }

    #[test]
    fn unconfirmed_report_does_not_change_aggregate() {
        let mut h = harness();
        connect(&mut h.service, 1);
        h.service.handle_event(BackgroundEvent::PortMessage {
            tab_id: 1,
            message: TabMessage::Muted { final_state: false },
        });
        assert!(!h.service.state().is_muted);

        report(&mut h.service, 1, true);
        assert!(h.service.state().is_muted);
        assert_eq!(h.service.badge_appearance(), BadgeAppearance::Muted);
    }

    #[test]
    fn direct_ui_toggle_skips_optimistic_paint() {
        let mut h = harness();
        let port = connect(&mut h.service, 1);
        report(&mut h.service, 1, false);
        h.badge.clear_history();

        let outcome = h.service.toggle(ToggleSource::Icon);

        assert!(outcome.requested);
        assert!(h.badge.text_history().is_empty());
        assert_eq!(port.sent(), vec![BackgroundMessage::ToggleMute { muted: true }]);
        assert_eq!(h.store.value(MUTED_KEY), Some(json!(true)));

        h.service.advance(Duration::from_millis(299));
        assert!(h.badge.text_history().is_empty());
        h.service.advance(Duration::from_millis(1));
        assert_eq!(h.badge.text(), BadgeAppearance::Muted.text());
    }

    #[test]
    fn storage_failure_does_not_stop_broadcast() {
        let mut h = harness();
        let port = connect(&mut h.service, 1);
        h.store.fail_reads(true);
        h.store.fail_writes(true);

        let outcome = h.service.toggle(ToggleSource::Shortcut);

        assert!(outcome.requested);
        assert_eq!(port.sent(), vec![BackgroundMessage::ToggleMute { muted: true }]);
        h.service.advance(Duration::from_secs(2));
    }

    #[test]
    fn unknown_command_is_ignored() {
        let mut h = harness();
        let port = connect(&mut h.service, 1);
        assert!(h.service.command("open-settings").is_none());
        assert!(port.sent().is_empty());
        assert_eq!(h.store.value(MUTED_KEY), None);
    }

    #[test]
    fn toggle_command_uses_longer_recheck() {
        let mut h = harness();
        connect(&mut h.service, 1);
        report(&mut h.service, 1, true);
        h.service.handle_event(BackgroundEvent::Command(TOGGLE_COMMAND.to_string()));

        // Optimistic paint for preference false -> true, though the tab said muted.
        assert_eq!(h.badge.text(), BadgeAppearance::Muted.text());
        report(&mut h.service, 1, false);
        assert_eq!(h.badge.text(), BadgeAppearance::Unmuted.text());

        h.service.advance(Duration::from_millis(999));
        assert_eq!(h.badge.text(), BadgeAppearance::Unmuted.text());
        h.service.advance(Duration::from_millis(1));
        assert_eq!(h.badge.text(), BadgeAppearance::Muted.text());
    }

    #[test]
    fn disconnected_report_detaches_and_button_found_reattaches() {
        let mut h = harness();
        let port = connect(&mut h.service, 5);
        report(&mut h.service, 5, true);

        h.service.handle_event(BackgroundEvent::PortMessage {
            tab_id: 5,
            message: TabMessage::Disconnected,
        });
        assert_eq!(h.service.session_count(), 0);
        assert_eq!(h.service.snapshot().detached_tabs, vec![5]);
        assert_eq!(h.service.badge_appearance(), BadgeAppearance::Disconnected);

        h.service.handle_event(BackgroundEvent::PortMessage {
            tab_id: 5,
            message: TabMessage::MuteButtonFound,
        });
        assert_eq!(h.service.session_count(), 1);

        h.service.toggle(ToggleSource::Request);
        assert_eq!(port.sent().len(), 1);
    }

    #[test]
    fn confirmed_report_from_detached_tab_reattaches() {
        let mut h = harness();
        connect(&mut h.service, 5);
        h.service.handle_event(BackgroundEvent::PortMessage {
            tab_id: 5,
            message: TabMessage::Disconnected,
        });

        report(&mut h.service, 5, false);
        assert_eq!(h.service.session_count(), 1);
        assert_eq!(h.service.badge_appearance(), BadgeAppearance::Unmuted);
    }

    #[test]
    fn tab_removed_drops_detached_channel() {
        let mut h = harness();
        connect(&mut h.service, 5);
        h.service.handle_event(BackgroundEvent::PortMessage {
            tab_id: 5,
            message: TabMessage::Disconnected,
        });
        h.service.handle_event(BackgroundEvent::TabRemoved { tab_id: 5 });
        assert!(h.service.snapshot().detached_tabs.is_empty());
    }

    #[test]
    fn one_shot_final_report_without_channel_is_rejected() {
        let mut h = harness();
        let response =
            h.service
                .handle_one_shot(Some("r1".into()), 8, TabMessage::state_report(true, true));
        assert!(!response.ok);
        assert_eq!(response.error.map(|e| e.code), Some("no_session".to_string()));
        assert!(!h.service.state().has_active_session);

        let response =
            h.service
                .handle_one_shot(None, 8, TabMessage::ContentScriptLoaded);
        assert!(response.ok);
    }

    #[test]
    fn fallback_reaches_matching_tabs_without_warning() {
        let mut h = harness();
        h.tabs.add_tab(11, "https://meet.google.com/abc-defg-hij");
        h.tabs.add_tab(12, "https://example.com/");

        let outcome = h.service.toggle(ToggleSource::Icon);

        assert_eq!(outcome.fallback, vec![11]);
        assert!(!outcome.warned);
        assert_eq!(
            h.tabs.sent(),
            vec![(11, BackgroundMessage::ToggleMute { muted: true })]
        );
        assert_ne!(h.badge.text(), "!");
    }

    #[test]
    fn invalid_pattern_does_not_disable_fallback() {
        let tabs = FakeTabs::default();
        tabs.add_tab(11, "https://meet.google.com/abc-defg-hij");
        let mut config = MuteConfig::default();
        config.page.url_patterns.insert(0, "not a pattern".to_string());
        let mut service = BackgroundService::new(
            config,
            Box::new(MemoryStore::default()),
            Box::new(BadgeRecorder::default()),
            Box::new(tabs.clone()),
        );

        let outcome = service.toggle(ToggleSource::Request);

        assert_eq!(outcome.fallback, vec![11]);
        assert!(!outcome.warned);
    }

    #[test]
    fn failed_fallback_sends_are_swallowed() {
        let mut h = harness();
        h.tabs.add_tab(11, "https://meet.google.com/abc-defg-hij");
        h.tabs.make_unreachable(11);

        let outcome = h.service.toggle(ToggleSource::Request);
        assert!(outcome.fallback.is_empty());
        assert!(outcome.warned);
    }

    #[test]
    fn new_confirmed_state_ends_warning_early() {
        let mut h = harness();
        h.service.toggle(ToggleSource::Icon);
        assert_eq!(h.badge.text(), "!");

        connect(&mut h.service, 2);
        report(&mut h.service, 2, true);
        assert_eq!(h.badge.text(), BadgeAppearance::Muted.text());
        assert!(!h.service.snapshot().warning_active);
    }
}
