//! # mutesync-core
//!
//! Keeps a conferencing page's microphone state in sync with an icon badge.
//! A background service owns the sessions and the badge; one observer agent
//! per tab watches the page's mute control and reports what it confirms.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Hosts feed events and elapsed time in.
//! - **Single-threaded**: Each side handles one event at a time; no locks.
//! - **Confirmed state only**: The aggregate mute flag changes only on
//!   verified reports from a tab, never on a request.
//! - **Best-effort I/O**: Platform failures are logged and skipped, never fatal.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mutesync_core::{BackgroundEvent, BackgroundService, MuteConfig};
//!
//! let mut service = BackgroundService::new(MuteConfig::default(), store, badge, tabs);
//! service.handle_event(BackgroundEvent::IconClicked);
//! service.run_due(elapsed);
//! ```

pub mod background;
pub mod badge;
pub mod config;
pub mod error;
pub mod observer;
pub mod patterns;
pub mod platform;
pub mod preference;
pub mod registry;
pub mod scheduler;
pub mod storage;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use background::{
    BackgroundEvent, BackgroundService, BackgroundSnapshot, BackgroundTask, ToggleOutcome,
};
pub use badge::{BadgeAppearance, CONNECTED_TAB_HINT};
pub use config::*;
pub use error::{MuteError, Result};
pub use observer::{AttachState, ObserverAgent, ObserverEvent, ObserverTask};
pub use patterns::{matches_any, UrlPattern};
pub use platform::*;
pub use preference::{LocalPreference, MUTED_KEY};
pub use registry::{AggregateMuteState, BroadcastOutcome, SessionInfo, SessionRegistry};
pub use scheduler::{Scheduler, TaskId};
pub use storage::*;
