//! Session Registry: one entry per tab hosting a live conferencing session.
//!
//! The registry is the only owner of the session channels and the only
//! mutator of the aggregate mute state. Callers (the background service)
//! decide what to repaint from the values these methods return.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use mutesync_protocol::{BackgroundMessage, TabId};

use crate::platform::TabPort;

/// Process-wide record of the last confirmed mute flag and whether any
/// session exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateMuteState {
    pub is_muted: bool,
    pub has_active_session: bool,
}

struct Session {
    port: Box<dyn TabPort>,
    connected_at: DateTime<Utc>,
    last_confirmed: Option<bool>,
    last_report_at: Option<DateTime<Utc>>,
}

/// Serializable view of a session for state snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub tab_id: TabId,
    pub connected_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_confirmed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report_at: Option<String>,
}

/// Per-tab result of a broadcast. Failed sessions have already been removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: Vec<TabId>,
    pub dropped: Vec<TabId>,
}

impl BroadcastOutcome {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.dropped.len()
    }
}

pub struct SessionRegistry {
    sessions: BTreeMap<TabId, Session>,
    state: AggregateMuteState,
}

impl SessionRegistry {
    /// `initial_muted` seeds `is_muted` (normally from the Local Preference)
    /// so the aggregate never starts undefined.
    pub fn new(initial_muted: bool) -> Self {
        Self {
            sessions: BTreeMap::new(),
            state: AggregateMuteState {
                is_muted: initial_muted,
                has_active_session: false,
            },
        }
    }

    pub fn state(&self) -> AggregateMuteState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, tab_id: TabId) -> bool {
        self.sessions.contains_key(&tab_id)
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.sessions.keys().copied().collect()
    }

    /// Inserts or replaces the session for `tab_id`. Returns `true` when an
    /// existing session was replaced.
    pub fn register(&mut self, tab_id: TabId, port: Box<dyn TabPort>) -> bool {
        let session = Session {
            port,
            connected_at: Utc::now(),
            last_confirmed: None,
            last_report_at: None,
        };
        let replaced = self.sessions.insert(tab_id, session).is_some();
        self.state.has_active_session = true;
        tracing::info!(
            tab_id,
            replaced,
            sessions = self.sessions.len(),
            "Session registered"
        );
        replaced
    }

    /// Removes the session and hands back its channel, if any.
    pub fn unregister(&mut self, tab_id: TabId) -> Option<Box<dyn TabPort>> {
        let removed = self.sessions.remove(&tab_id);
        self.state.has_active_session = !self.sessions.is_empty();
        if removed.is_some() {
            tracing::info!(
                tab_id,
                sessions = self.sessions.len(),
                "Session unregistered"
            );
        }
        removed.map(|session| session.port)
    }

    /// Applies a confirmed report. Always marks a session as active.
    pub fn report_final(&mut self, tab_id: TabId, muted: bool) {
        self.state.is_muted = muted;
        self.state.has_active_session = true;
        if let Some(session) = self.sessions.get_mut(&tab_id) {
            session.last_confirmed = Some(muted);
            session.last_report_at = Some(Utc::now());
        }
        tracing::debug!(tab_id, muted, "Confirmed mute state applied");
    }

    /// Handles an explicit "disconnected" report from a tab's agent.
    ///
    /// The session is detached and its channel returned to the caller. The
    /// aggregate only changes when no other session remains; otherwise the
    /// remaining sessions still define it.
    pub fn report_disconnected(&mut self, tab_id: TabId) -> Option<Box<dyn TabPort>> {
        let detached = self.sessions.remove(&tab_id).map(|session| session.port);
        if self.sessions.is_empty() {
            self.state.has_active_session = false;
        }
        tracing::info!(
            tab_id,
            remaining = self.sessions.len(),
            "Session reported disconnected"
        );
        detached
    }

    /// Sends `message` to every session. A session whose send fails is
    /// treated as stale and removed; the broadcast carries on regardless.
    pub fn broadcast(&mut self, message: &BackgroundMessage) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        for (tab_id, session) in self.sessions.iter_mut() {
            match session.port.post(message) {
                Ok(()) => outcome.delivered.push(*tab_id),
                Err(err) => {
                    tracing::warn!(
                        tab_id = *tab_id,
                        error = %err,
                        "Dropping stale session after send failure"
                    );
                    outcome.dropped.push(*tab_id);
                }
            }
        }

        for tab_id in &outcome.dropped {
            self.unregister(*tab_id);
        }

        outcome
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|(tab_id, session)| SessionInfo {
                tab_id: *tab_id,
                connected_at: session.connected_at.to_rfc3339(),
                last_confirmed: session.last_confirmed,
                last_report_at: session.last_report_at.map(|at| at.to_rfc3339()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePort;

    fn port(tab_id: TabId) -> Box<dyn TabPort> {
        Box::new(FakePort::new(tab_id).0)
    }

    fn assert_invariant(registry: &SessionRegistry) {
        assert_eq!(registry.state().has_active_session, !registry.is_empty());
    }

    #[test]
    fn active_flag_tracks_registration_sequence() {
        let mut registry = SessionRegistry::new(false);
        assert_invariant(&registry);

        let steps: [(bool, TabId); 7] = [
            (true, 1),
            (true, 2),
            (false, 1),
            (true, 2),
            (false, 2),
            (false, 3),
            (true, 3),
        ];
        for (register, tab_id) in steps {
            if register {
                registry.register(tab_id, port(tab_id));
            } else {
                registry.unregister(tab_id);
            }
            assert_invariant(&registry);
        }
        assert_eq!(registry.tab_ids(), vec![3]);
    }

    #[test]
    fn register_replaces_existing_session() {
        let mut registry = SessionRegistry::new(false);
        assert!(!registry.register(7, port(7)));
        assert!(registry.register(7, port(7)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn report_final_always_marks_active() {
        let mut registry = SessionRegistry::new(false);
        registry.register(1, port(1));
        registry.report_disconnected(1);
        assert!(!registry.state().has_active_session);

        registry.report_final(1, true);
        assert_eq!(
            registry.state(),
            AggregateMuteState {
                is_muted: true,
                has_active_session: true,
            }
        );
    }

    #[test]
    fn disconnect_of_one_of_two_sessions_keeps_aggregate() {
        let mut registry = SessionRegistry::new(false);
        registry.register(1, port(1));
        registry.register(2, port(2));
        registry.report_final(2, true);

        let detached = registry.report_disconnected(1);
        assert!(detached.is_some());
        assert_eq!(
            registry.state(),
            AggregateMuteState {
                is_muted: true,
                has_active_session: true,
            }
        );
    }

    #[test]
    fn last_disconnect_clears_active_but_keeps_muted_flag() {
        let mut registry = SessionRegistry::new(false);
        registry.register(1, port(1));
        registry.report_final(1, true);

        registry.report_disconnected(1);
        let state = registry.state();
        assert!(!state.has_active_session);
        assert!(state.is_muted);
    }

    #[test]
    fn broadcast_drops_only_failing_session() {
        let mut registry = SessionRegistry::new(false);
        let (healthy, healthy_handle) = FakePort::new(1);
        let (failing, failing_handle) = FakePort::new(2);
        failing_handle.close();
        registry.register(1, Box::new(healthy));
        registry.register(2, Box::new(failing));

        let message = BackgroundMessage::ToggleMute { muted: true };
        let outcome = registry.broadcast(&message);

        assert_eq!(outcome.delivered, vec![1]);
        assert_eq!(outcome.dropped, vec![2]);
        assert_eq!(registry.tab_ids(), vec![1]);
        assert_eq!(healthy_handle.sent(), vec![message]);
        assert_invariant(&registry);
    }

    #[test]
    fn broadcast_failure_of_last_session_clears_active() {
        let mut registry = SessionRegistry::new(false);
        let (failing, handle) = FakePort::new(4);
        handle.close();
        registry.register(4, Box::new(failing));

        let outcome = registry.broadcast(&BackgroundMessage::ToggleMute { muted: false });
        assert_eq!(outcome.attempted(), 1);
        assert!(registry.is_empty());
        assert!(!registry.state().has_active_session);
    }

    #[test]
    fn snapshot_reports_last_confirmed_value() {
        let mut registry = SessionRegistry::new(false);
        registry.register(9, port(9));
        registry.report_final(9, false);

        let sessions = registry.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].tab_id, 9);
        assert_eq!(sessions[0].last_confirmed, Some(false));
        assert!(sessions[0].last_report_at.is_some());
    }
}
