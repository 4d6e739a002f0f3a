//! Host implementations of the platform seams.
//!
//! - `SocketPort`: a tab's persistent connection, one JSON object per line.
//! - `FileBadge`: the badge, mirrored to `badge.json` for external renderers.
//! - `HostTabs`: URLs of tabs seen so far, for the fallback broadcast.

use chrono::Utc;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use mutesync_core::{
    matches_any, BadgeSurface, MuteError, Result, TabDirectory, TabInfo, TabPort, UrlPattern,
};
use mutesync_protocol::{BackgroundMessage, TabId};

/// A tab that stops reading must not hold the service thread.
const CHANNEL_WRITE_TIMEOUT_MS: u64 = 600;

pub struct SocketPort {
    tab_id: TabId,
    stream: UnixStream,
}

impl SocketPort {
    pub fn new(tab_id: TabId, stream: UnixStream) -> Self {
        if let Err(err) =
            stream.set_write_timeout(Some(Duration::from_millis(CHANNEL_WRITE_TIMEOUT_MS)))
        {
            tracing::warn!(tab_id, error = %err, "Failed to set channel write timeout");
        }
        Self { tab_id, stream }
    }

    /// Writes any serializable value as a single line.
    pub fn write_line<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut payload = serde_json::to_vec(value).map_err(|source| MuteError::Json {
            context: format!("serializing message for tab {}", self.tab_id),
            source,
        })?;
        payload.push(b'\n');
        let written = self
            .stream
            .write_all(&payload)
            .and_then(|_| self.stream.flush());
        if let Err(err) = written {
            // A partial line may be on the wire; nothing after it can be framed.
            let _ = self.stream.shutdown(Shutdown::Both);
            return Err(MuteError::SendFailed {
                tab_id: self.tab_id,
                details: err.to_string(),
            });
        }
        Ok(())
    }
}

impl TabPort for SocketPort {
    fn tab_id(&self) -> TabId {
        self.tab_id
    }

    fn post(&mut self, message: &BackgroundMessage) -> Result<()> {
        self.write_line(message)
    }
}

/// What `badge.json` holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeFile {
    pub text: String,
    pub color: String,
    pub title: String,
    #[serde(default)]
    pub tab_titles: BTreeMap<TabId, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

pub struct FileBadge {
    path: PathBuf,
    state: BadgeFile,
}

impl FileBadge {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: BadgeFile::default(),
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.state.updated_at = Some(Utc::now().to_rfc3339());
        write_atomic(&self.path, &self.state)
    }
}

impl BadgeSurface for FileBadge {
    fn set_text(&mut self, text: &str) -> Result<()> {
        self.state.text = text.to_string();
        self.commit()
    }

    fn set_background_color(&mut self, color: &str) -> Result<()> {
        self.state.color = color.to_string();
        self.commit()
    }

    fn set_title(&mut self, title: &str) -> Result<()> {
        self.state.title = title.to_string();
        self.commit()
    }

    fn set_tab_title(&mut self, tab_id: TabId, title: &str) -> Result<()> {
        self.state.tab_titles.insert(tab_id, title.to_string());
        self.commit()
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| MuteError::Badge(format!("Failed to create badge dir: {}", err)))?;
    }

    let payload = serde_json::to_vec_pretty(value).map_err(|source| MuteError::Json {
        context: "serializing badge".to_string(),
        source,
    })?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload)
        .map_err(|err| MuteError::Badge(format!("Failed to write badge: {}", err)))?;
    fs::rename(&tmp_path, path)
        .map_err(|err| MuteError::Badge(format!("Failed to commit badge: {}", err)))?;
    Ok(())
}

/// Tabs known to the daemon by URL. A host daemon has no way to reach a
/// tab that holds no open connection, so one-shot delivery always fails.
#[derive(Debug, Clone, Default)]
pub struct HostTabs {
    known: Rc<RefCell<BTreeMap<TabId, String>>>,
}

impl HostTabs {
    pub fn remember(&self, tab_id: TabId, url: &str) {
        self.known.borrow_mut().insert(tab_id, url.to_string());
    }

    pub fn forget(&self, tab_id: TabId) {
        self.known.borrow_mut().remove(&tab_id);
    }

    pub fn len(&self) -> usize {
        self.known.borrow().len()
    }
}

impl TabDirectory for HostTabs {
    fn query_tabs(&self, patterns: &[UrlPattern]) -> Result<Vec<TabInfo>> {
        Ok(self
            .known
            .borrow()
            .iter()
            .filter(|(_, url)| matches_any(patterns, url))
            .map(|(tab_id, url)| TabInfo {
                tab_id: *tab_id,
                url: url.clone(),
            })
            .collect())
    }

    fn send_once(&mut self, tab_id: TabId, _message: &BackgroundMessage) -> Result<()> {
        Err(MuteError::NoReceiver(tab_id))
    }
}
