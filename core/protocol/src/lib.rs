//! Message vocabulary and IPC envelope for mutesync.
//!
//! This crate is shared by the background daemon and its tab-side clients to
//! prevent schema drift. Two shapes travel over the socket:
//!
//! - One-shot [`Request`]/[`Response`] pairs, one JSON object per line.
//! - Channel messages ([`TabMessage`], [`BackgroundMessage`]) exchanged on a
//!   persistent connection opened with [`Method::Connect`].
//!
//! The daemon remains the authority on validation, but clients reuse the same
//! types to construct valid requests.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

/// Name a tab agent must present when opening a persistent channel.
pub const PORT_NAME: &str = "meet-mute";

/// Keyboard command registered for toggling mute.
pub const TOGGLE_COMMAND: &str = "toggle-mute";

pub type TabId = u32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetState,
    ToggleMute,
    Command,
    TabMessage,
    Connect,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Messages sent from a tab's observer agent to the background process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabMessage {
    ContentScriptLoaded,
    Muted {
        #[serde(default)]
        final_state: bool,
    },
    Unmuted {
        #[serde(default)]
        final_state: bool,
    },
    Disconnected,
    MuteButtonFound,
    MuteButtonNotFound,
}

impl TabMessage {
    pub fn state_report(muted: bool, final_state: bool) -> Self {
        if muted {
            TabMessage::Muted { final_state }
        } else {
            TabMessage::Unmuted { final_state }
        }
    }

    /// Returns `(muted, final_state)` for state reports.
    pub fn reported_state(&self) -> Option<(bool, bool)> {
        match self {
            TabMessage::Muted { final_state } => Some((true, *final_state)),
            TabMessage::Unmuted { final_state } => Some((false, *final_state)),
            _ => None,
        }
    }
}

/// Messages sent from the background process to a tab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackgroundMessage {
    ToggleMute { muted: bool },
}

/// Where a toggle request came from.
///
/// Only `Icon` counts as a direct UI action: it skips the optimistic badge
/// paint and uses the shorter safety-net delay.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToggleSource {
    Icon,
    Shortcut,
    #[default]
    Request,
}

impl ToggleSource {
    pub fn is_direct_ui(self) -> bool {
        matches!(self, ToggleSource::Icon)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToggleSource::Icon => "icon",
            ToggleSource::Shortcut => "shortcut",
            ToggleSource::Request => "request",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleParams {
    #[serde(default)]
    pub source: ToggleSource,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandParams {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TabMessageParams {
    pub tab_id: TabId,
    #[serde(default)]
    pub url: Option<String>,
    pub message: TabMessage,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectParams {
    pub tab_id: TabId,
    pub url: String,
    pub port_name: String,
}

pub fn parse_toggle(params: Option<Value>) -> Result<ToggleParams, ErrorInfo> {
    match params {
        Some(params) => parse_params(params, "toggle"),
        None => Ok(ToggleParams::default()),
    }
}

pub fn parse_command(params: Option<Value>) -> Result<CommandParams, ErrorInfo> {
    let parsed: CommandParams = parse_params(require_params(params, "name")?, "command")?;
    require_string(&parsed.name, "name")?;
    Ok(parsed)
}

pub fn parse_tab_message(params: Option<Value>) -> Result<TabMessageParams, ErrorInfo> {
    let parsed: TabMessageParams =
        parse_params(require_params(params, "tab_id")?, "tab_message")?;
    require_tab_id(parsed.tab_id)?;
    if let Some(url) = &parsed.url {
        require_string(url, "url")?;
    }
    Ok(parsed)
}

pub fn parse_connect(params: Option<Value>) -> Result<ConnectParams, ErrorInfo> {
    let parsed: ConnectParams = parse_params(require_params(params, "tab_id")?, "connect")?;
    require_tab_id(parsed.tab_id)?;
    require_string(&parsed.url, "url")?;
    if parsed.port_name != PORT_NAME {
        return Err(ErrorInfo::new(
            "invalid_port_name",
            format!("port_name must be {}", PORT_NAME),
        ));
    }
    Ok(parsed)
}

fn require_params(params: Option<Value>, first_field: &str) -> Result<Value, ErrorInfo> {
    params.ok_or_else(|| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} is required", first_field),
        )
    })
}

fn parse_params<T: DeserializeOwned>(params: Value, label: &str) -> Result<T, ErrorInfo> {
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", label, err),
        )
    })
}

fn require_string(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn require_tab_id(tab_id: TabId) -> Result<(), ErrorInfo> {
    if tab_id == 0 {
        return Err(ErrorInfo::new("invalid_tab_id", "tab_id is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tab_messages_use_snake_case_tags() {
        let value = serde_json::to_value(TabMessage::Muted { final_state: true }).unwrap();
        assert_eq!(value, json!({"type": "muted", "final_state": true}));

        let parsed: TabMessage =
            serde_json::from_value(json!({"type": "mute_button_not_found"})).unwrap();
        assert_eq!(parsed, TabMessage::MuteButtonNotFound);
    }

    #[test]
    fn state_report_without_flag_is_not_final() {
        let parsed: TabMessage = serde_json::from_value(json!({"type": "unmuted"})).unwrap();
        assert_eq!(parsed.reported_state(), Some((false, false)));
        assert_eq!(TabMessage::Disconnected.reported_state(), None);
    }

    #[test]
    fn toggle_command_carries_requested_value() {
        let value = serde_json::to_value(BackgroundMessage::ToggleMute { muted: true }).unwrap();
        assert_eq!(value, json!({"type": "toggle_mute", "muted": true}));
    }

    #[test]
    fn toggle_defaults_to_request_source() {
        let parsed = parse_toggle(None).unwrap();
        assert_eq!(parsed.source, ToggleSource::Request);

        let parsed = parse_toggle(Some(json!({"source": "icon"}))).unwrap();
        assert!(parsed.source.is_direct_ui());
    }

    #[test]
    fn rejects_zero_tab_id() {
        let params = json!({"tab_id": 0, "message": {"type": "disconnected"}});
        let err = parse_tab_message(Some(params)).unwrap_err();
        assert_eq!(err.code, "invalid_tab_id");
    }

    #[test]
    fn rejects_wrong_port_name() {
        let params = json!({"tab_id": 4, "url": "https://meet.google.com/abc-defg-hij", "port_name": "other"});
        let err = parse_connect(Some(params)).unwrap_err();
        assert_eq!(err.code, "invalid_port_name");
    }

    #[test]
    fn rejects_blank_url_on_connect() {
        let params = json!({"tab_id": 4, "url": "  ", "port_name": PORT_NAME});
        let err = parse_connect(Some(params)).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_unknown_request_fields() {
        let raw = json!({"protocol_version": 1, "method": "get_health", "extra": true});
        assert!(serde_json::from_value::<Request>(raw).is_err());
    }

    #[test]
    fn command_requires_name() {
        assert!(parse_command(None).is_err());
        assert!(parse_command(Some(json!({"name": ""}))).is_err());
        let parsed = parse_command(Some(json!({"name": TOGGLE_COMMAND}))).unwrap();
        assert_eq!(parsed.name, TOGGLE_COMMAND);
    }
}
