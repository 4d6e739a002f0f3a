//! `mutesync observe`: an observer agent driving a simulated page.
//!
//! The page has one mute control whose attribute follows the shortcut after
//! a configurable lag, standing in for a real conferencing tab. The agent
//! talks to the daemon over a real channel, so the whole reconciliation
//! round trip can be exercised by hand.

use std::cell::RefCell;
use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use mutesync_core::{
    BackgroundLink, KeyChord, MuteConfig, MuteError, ObserverAgent, ObserverEvent, PageDom,
    Result,
};
use mutesync_protocol::{BackgroundMessage, TabId, TabMessage};

use crate::daemon_client;

const IDLE_WAIT: Duration = Duration::from_millis(250);

pub struct ObserveOptions {
    pub tab_id: TabId,
    pub url: String,
    pub muted: bool,
    pub lag: Duration,
    /// Remove and restore the control on this period.
    pub flap: Option<Duration>,
    /// Unload the page after this long.
    pub duration: Option<Duration>,
    pub config: MuteConfig,
}

enum LinkEvent {
    Message(BackgroundMessage),
    Closed,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Simulated page
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct PageState {
    present: bool,
    muted: bool,
    /// When a pressed shortcut takes effect.
    pending_flip: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SimulatedPage {
    state: Rc<RefCell<PageState>>,
    lag: Duration,
}

impl SimulatedPage {
    pub fn new(muted: bool, lag: Duration) -> Self {
        Self {
            state: Rc::new(RefCell::new(PageState {
                present: true,
                muted,
                pending_flip: None,
            })),
            lag,
        }
    }

    /// Applies a pending flip once due. Returns `true` if the attribute changed.
    pub fn settle(&self, now: Instant) -> bool {
        let mut state = self.state.borrow_mut();
        match state.pending_flip {
            Some(at) if at <= now => {
                state.pending_flip = None;
                state.muted = !state.muted;
                true
            }
            _ => false,
        }
    }

    pub fn next_change(&self) -> Option<Instant> {
        self.state.borrow().pending_flip
    }

    pub fn is_present(&self) -> bool {
        self.state.borrow().present
    }

    pub fn set_present(&self, present: bool) {
        let mut state = self.state.borrow_mut();
        state.present = present;
        if !present {
            state.pending_flip = None;
        }
    }

    pub fn muted(&self) -> bool {
        self.state.borrow().muted
    }
}

impl PageDom for SimulatedPage {
    fn control_present(&self, _selector: &str) -> bool {
        self.is_present()
    }

    fn read_attribute(&self, _selector: &str, _attribute: &str) -> Option<String> {
        let state = self.state.borrow();
        state.present.then(|| state.muted.to_string())
    }

    fn dispatch_key(&mut self, chord: &KeyChord) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.present {
            return Err(MuteError::Page(format!("{} pressed with no mute control", chord)));
        }
        // A second press before the first lands cancels it out.
        state.pending_flip = match state.pending_flip {
            Some(_) => None,
            None => Instant::now().checked_add(self.lag),
        };
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Channel to the daemon
// ═══════════════════════════════════════════════════════════════════════════════

pub struct SocketLink {
    tab_id: TabId,
    url: String,
    events: Sender<LinkEvent>,
    writer: Option<UnixStream>,
}

impl SocketLink {
    fn new(tab_id: TabId, url: String, events: Sender<LinkEvent>) -> Self {
        Self {
            tab_id,
            url,
            events,
            writer: None,
        }
    }
}

impl BackgroundLink for SocketLink {
    fn connect(&mut self, port_name: &str) -> Result<()> {
        let channel = daemon_client::open_channel(self.tab_id, &self.url, port_name)
            .map_err(MuteError::LinkUnavailable)?;
        spawn_reader(self.tab_id, channel.reader, self.events.clone());
        self.writer = Some(channel.writer);
        Ok(())
    }

    fn post(&mut self, message: &TabMessage) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| MuteError::LinkUnavailable("channel is not open".to_string()))?;
        if let Err(err) = daemon_client::write_json_line(writer, message) {
            self.writer = None;
            return Err(MuteError::LinkUnavailable(err));
        }
        Ok(())
    }

    fn send_once(&mut self, message: &TabMessage) -> Result<()> {
        daemon_client::tab_message(self.tab_id, &self.url, message)
            .map(|_| ())
            .map_err(MuteError::LinkUnavailable)
    }
}

fn spawn_reader(tab_id: TabId, mut reader: BufReader<UnixStream>, events: Sender<LinkEvent>) {
    thread::spawn(move || loop {
        match daemon_client::read_json_line::<BackgroundMessage>(&mut reader) {
            Ok(message) => {
                if events.send(LinkEvent::Message(message)).is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::info!(tab_id, error = %err, "Channel to daemon ended");
                let _ = events.send(LinkEvent::Closed);
                return;
            }
        }
    });
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event loop
// ═══════════════════════════════════════════════════════════════════════════════

pub fn run(options: ObserveOptions) -> std::result::Result<(), String> {
    let (events, inbox) = mpsc::channel();
    let page = SimulatedPage::new(options.muted, options.lag);
    let link = SocketLink::new(options.tab_id, options.url.clone(), events);
    let mut agent = ObserverAgent::new(options.config, Box::new(page.clone()), Box::new(link));

    let started = Instant::now();
    let deadline = options.duration.and_then(|duration| later(started, duration));
    let mut next_flap = options.flap.and_then(|period| later(started, period));

    tracing::info!(tab_id = options.tab_id, url = %options.url, "Observer starting");
    agent.handle_event(ObserverEvent::Started);
    if !agent.is_connected() {
        return Err("Could not open a channel to the daemon".to_string());
    }
    report(options.tab_id, &page);

    loop {
        let now = Instant::now();
        if deadline.is_some_and(|at| now >= at) {
            agent.handle_event(ObserverEvent::PageUnload);
            break;
        }

        if page.settle(now) {
            report(options.tab_id, &page);
            agent.handle_event(ObserverEvent::AttributeChanged);
        }

        if let (Some(at), Some(period)) = (next_flap, options.flap) {
            if now >= at {
                page.set_present(!page.is_present());
                println!(
                    "tab {}: mute control {}",
                    options.tab_id,
                    if page.is_present() { "restored" } else { "removed" }
                );
                agent.handle_event(ObserverEvent::BodyClassChanged);
                next_flap = later(at, period);
            }
        }

        agent.run_due(started.elapsed());

        let wait = [
            agent.time_until_next_task(),
            page.next_change().map(|at| at.saturating_duration_since(now)),
            next_flap.map(|at| at.saturating_duration_since(now)),
            deadline.map(|at| at.saturating_duration_since(now)),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(IDLE_WAIT)
        .min(IDLE_WAIT);

        match inbox.recv_timeout(wait) {
            Ok(LinkEvent::Message(BackgroundMessage::ToggleMute { muted })) => {
                agent.run_due(started.elapsed());
                println!("tab {}: toggle requested (muted: {})", options.tab_id, muted);
                agent.handle_event(ObserverEvent::ToggleCommand { muted });
            }
            Ok(LinkEvent::Closed) => agent.handle_event(ObserverEvent::PortDisconnected),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!(tab_id = options.tab_id, "Observer stopped");
    Ok(())
}

/// `None` when the offset is past what `Instant` can represent.
fn later(from: Instant, by: Duration) -> Option<Instant> {
    from.checked_add(by)
}

fn report(tab_id: TabId, page: &SimulatedPage) {
    println!(
        "tab {}: microphone {}",
        tab_id,
        if page.muted() { "muted" } else { "on" }
    );
}
