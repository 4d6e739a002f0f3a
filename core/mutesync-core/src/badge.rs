//! Badge Presenter: maps aggregate mute state to the icon badge.

use serde::Serialize;

use mutesync_protocol::TabId;

use crate::platform::BadgeSurface;
use crate::registry::AggregateMuteState;

pub const CONNECTED_TAB_HINT: &str = "Connected to meeting";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeAppearance {
    Disconnected,
    Muted,
    Unmuted,
    /// Timed override shown when an action finds no session.
    NoSessionWarning,
}

impl BadgeAppearance {
    /// A missing session always wins over the mute flag.
    pub fn for_state(state: AggregateMuteState) -> Self {
        match (state.has_active_session, state.is_muted) {
            (false, _) => BadgeAppearance::Disconnected,
            (true, true) => BadgeAppearance::Muted,
            (true, false) => BadgeAppearance::Unmuted,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            BadgeAppearance::Disconnected => "",
            BadgeAppearance::Muted => "OFF",
            BadgeAppearance::Unmuted => "ON",
            BadgeAppearance::NoSessionWarning => "!",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            BadgeAppearance::Disconnected => "#5F6368",
            BadgeAppearance::Muted => "#D93025",
            BadgeAppearance::Unmuted => "#188038",
            BadgeAppearance::NoSessionWarning => "#F29900",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            BadgeAppearance::Disconnected => "No active meeting",
            BadgeAppearance::Muted => "Microphone muted",
            BadgeAppearance::Unmuted => "Microphone on",
            BadgeAppearance::NoSessionWarning => "No meeting tab found",
        }
    }
}

/// Paints `appearance`. Each surface call is attempted independently; returns
/// `false` if any of them failed (failures are logged).
pub fn paint(surface: &mut dyn BadgeSurface, appearance: BadgeAppearance) -> bool {
    let results = [
        ("text", surface.set_text(appearance.text())),
        ("color", surface.set_background_color(appearance.color())),
        ("title", surface.set_title(appearance.title())),
    ];

    let mut ok = true;
    for (part, result) in results {
        if let Err(err) = result {
            tracing::warn!(part, appearance = ?appearance, error = %err, "Badge update failed");
            ok = false;
        }
    }
    tracing::debug!(appearance = ?appearance, "Badge painted");
    ok
}

pub fn mark_tab_connected(surface: &mut dyn BadgeSurface, tab_id: TabId) {
    if let Err(err) = surface.set_tab_title(tab_id, CONNECTED_TAB_HINT) {
        tracing::warn!(tab_id, error = %err, "Failed to set connected hint");
    }
}
