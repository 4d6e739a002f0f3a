//! The single service thread.
//!
//! Connection threads only parse lines and forward [`HostEvent`]s here; the
//! `BackgroundService` and every platform surface live on this one thread,
//! so events are handled strictly one at a time.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use mutesync_core::{
    BackgroundEvent, BackgroundService, JsonFileStore, MuteConfig, StorageConfig,
};
use mutesync_protocol::{
    parse_command, parse_tab_message, parse_toggle, ConnectParams, Method, Request, Response,
    TabId, TabMessage, PROTOCOL_VERSION,
};
use serde_json::json;

use crate::surfaces::{FileBadge, HostTabs, SocketPort};

/// Upper bound on how long the loop sleeps with no task pending.
const IDLE_WAIT: Duration = Duration::from_secs(60);

pub type ConnectionId = u64;

pub enum HostEvent {
    Request {
        request: Request,
        reply: Sender<Response>,
    },
    Connect {
        connection: ConnectionId,
        id: Option<String>,
        params: ConnectParams,
        stream: UnixStream,
    },
    ChannelMessage {
        connection: ConnectionId,
        tab_id: TabId,
        message: TabMessage,
    },
    ChannelClosed {
        connection: ConnectionId,
        tab_id: TabId,
    },
}

pub struct ServiceHost {
    service: BackgroundService,
    tabs: HostTabs,
    /// Current connection per tab; events from older connections are stale.
    channels: HashMap<TabId, ConnectionId>,
    started: Instant,
}

impl ServiceHost {
    pub fn new(config: MuteConfig, storage: &StorageConfig) -> Self {
        let tabs = HostTabs::default();
        let service = BackgroundService::new(
            config,
            Box::new(JsonFileStore::new(storage.storage_file())),
            Box::new(FileBadge::new(storage.badge_file())),
            Box::new(tabs.clone()),
        );
        Self {
            service,
            tabs,
            channels: HashMap::new(),
            started: Instant::now(),
        }
    }

    /// Runs until every sender is gone.
    pub fn run(mut self, events: Receiver<HostEvent>) {
        loop {
            let wait = self.service.time_until_next_task().unwrap_or(IDLE_WAIT);
            match events.recv_timeout(wait) {
                Ok(event) => {
                    self.tick();
                    self.handle(event);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.tick();
        }
        info!("Service loop stopped");
    }

    fn tick(&mut self) {
        self.service.run_due(self.started.elapsed());
    }

    pub fn handle(&mut self, event: HostEvent) {
        match event {
            HostEvent::Request { request, reply } => {
                let response = self.handle_request(request);
                if reply.send(response).is_err() {
                    debug!("Requester went away before the response");
                }
            }
            HostEvent::Connect {
                connection,
                id,
                params,
                stream,
            } => self.connect(connection, id, params, stream),
            HostEvent::ChannelMessage {
                connection,
                tab_id,
                message,
            } => {
                if !self.is_current(tab_id, connection) {
                    debug!(tab_id, connection, "Ignoring message from stale channel");
                    return;
                }
                self.service
                    .handle_event(BackgroundEvent::PortMessage { tab_id, message });
            }
            HostEvent::ChannelClosed { connection, tab_id } => {
                if !self.is_current(tab_id, connection) {
                    return;
                }
                self.channels.remove(&tab_id);
                self.tabs.forget(tab_id);
                self.service
                    .handle_event(BackgroundEvent::PortDisconnected { tab_id });
            }
        }
    }

    fn is_current(&self, tab_id: TabId, connection: ConnectionId) -> bool {
        self.channels.get(&tab_id) == Some(&connection)
    }

    fn connect(
        &mut self,
        connection: ConnectionId,
        id: Option<String>,
        params: ConnectParams,
        stream: UnixStream,
    ) {
        let tab_id = params.tab_id;
        let mut port = SocketPort::new(tab_id, stream);
        let ack = Response::ok(id, json!({"connected": true, "tab_id": tab_id}));
        if let Err(err) = port.write_line(&ack) {
            warn!(tab_id, error = %err, "Failed to acknowledge channel");
            return;
        }

        info!(tab_id, connection, url = %params.url, "Channel opened");
        self.tabs.remember(tab_id, &params.url);
        self.channels.insert(tab_id, connection);
        self.service.handle_event(BackgroundEvent::PortConnected {
            tab_id,
            port: Box::new(port),
        });
    }

    pub fn handle_request(&mut self, request: Request) -> Response {
        if request.protocol_version != PROTOCOL_VERSION {
            return Response::error(
                request.id,
                "protocol_mismatch",
                "unsupported protocol version",
            );
        }

        match request.method {
            Method::GetHealth => Response::ok(
                request.id,
                json!({
                    "status": "ok",
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol_version": PROTOCOL_VERSION,
                    "sessions": self.service.session_count(),
                    "known_tabs": self.tabs.len(),
                }),
            ),
            Method::GetState => to_response(request.id, &self.service.snapshot(), "state"),
            Method::ToggleMute => {
                let params = match parse_toggle(request.params) {
                    Ok(params) => params,
                    Err(err) => return Response::error_with_info(request.id, err),
                };
                let outcome = self.service.toggle(params.source);
                to_response(request.id, &outcome, "toggle outcome")
            }
            Method::Command => {
                let params = match parse_command(request.params) {
                    Ok(params) => params,
                    Err(err) => return Response::error_with_info(request.id, err),
                };
                match self.service.command(&params.name) {
                    Some(outcome) => to_response(request.id, &outcome, "toggle outcome"),
                    None => Response::error(
                        request.id,
                        "unknown_command",
                        format!("unknown command: {}", params.name),
                    ),
                }
            }
            Method::TabMessage => {
                let params = match parse_tab_message(request.params) {
                    Ok(params) => params,
                    Err(err) => return Response::error_with_info(request.id, err),
                };
                if let Some(url) = &params.url {
                    self.tabs.remember(params.tab_id, url);
                }
                self.service
                    .handle_one_shot(request.id, params.tab_id, params.message)
            }
            Method::Connect => Response::error(
                request.id,
                "invalid_method",
                "connect must be the first line of a channel",
            ),
        }
    }
}

fn to_response<T: serde::Serialize>(id: Option<String>, value: &T, what: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutesync_protocol::PORT_NAME;
    use std::io::{BufRead, BufReader};
    use tempfile::TempDir;

    fn host(temp: &TempDir) -> ServiceHost {
        ServiceHost::new(
            MuteConfig::default(),
            &StorageConfig::with_root(temp.path().to_path_buf()),
        )
    }

    fn request(method: Method, params: Option<serde_json::Value>) -> Request {
        Request::new(method, Some("t".to_string()), params)
    }

    fn open_channel(host: &mut ServiceHost, connection: ConnectionId, tab_id: TabId) -> BufReader<UnixStream> {
        let (ours, theirs) = UnixStream::pair().unwrap();
        host.handle(HostEvent::Connect {
            connection,
            id: Some("c".to_string()),
            params: ConnectParams {
                tab_id,
                url: "https://meet.google.com/abc-defg-hij".to_string(),
                port_name: PORT_NAME.to_string(),
            },
            stream: ours,
        });
        let mut reader = BufReader::new(theirs);
        let mut ack = String::new();
        reader.read_line(&mut ack).unwrap();
        let ack: Response = serde_json::from_str(&ack).unwrap();
        assert!(ack.ok);
        reader
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let mut req = request(Method::GetHealth, None);
        req.protocol_version = PROTOCOL_VERSION + 1;
        let response = host.handle_request(req);
        assert_eq!(response.error.unwrap().code, "protocol_mismatch");
    }

    #[test]
    fn toggle_reaches_open_channel() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let mut reader = open_channel(&mut host, 1, 42);

        let response = host.handle_request(request(
            Method::ToggleMute,
            Some(json!({"source": "shortcut"})),
        ));
        assert!(response.ok);

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), r#"{"type":"toggle_mute","muted":true}"#);
        assert!(temp.path().join("storage.json").exists());
        assert!(temp.path().join("badge.json").exists());
    }

    #[test]
    fn stale_channel_close_is_ignored() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let _old = open_channel(&mut host, 1, 42);
        let _new = open_channel(&mut host, 2, 42);

        host.handle(HostEvent::ChannelClosed {
            connection: 1,
            tab_id: 42,
        });
        assert_eq!(host.service.session_count(), 1);

        host.handle(HostEvent::ChannelClosed {
            connection: 2,
            tab_id: 42,
        });
        assert_eq!(host.service.session_count(), 0);
    }

    #[test]
    fn unknown_command_is_an_error_response() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let response = host.handle_request(request(
            Method::Command,
            Some(json!({"name": "open-settings"})),
        ));
        assert_eq!(response.error.unwrap().code, "unknown_command");
    }

    #[test]
    fn one_shot_report_without_channel_is_refused() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let response = host.handle_request(request(
            Method::TabMessage,
            Some(json!({
                "tab_id": 5,
                "url": "https://meet.google.com/abc-defg-hij",
                "message": {"type": "muted", "final_state": true}
            })),
        ));
        assert_eq!(response.error.unwrap().code, "no_session");
    }

    #[test]
    fn state_snapshot_lists_sessions() {
        let temp = TempDir::new().unwrap();
        let mut host = host(&temp);
        let _channel = open_channel(&mut host, 1, 9);
        host.handle(HostEvent::ChannelMessage {
            connection: 1,
            tab_id: 9,
            message: TabMessage::state_report(true, true),
        });

        let response = host.handle_request(request(Method::GetState, None));
        let data = response.data.unwrap();
        assert_eq!(data["state"]["is_muted"], json!(true));
        assert_eq!(data["state"]["has_active_session"], json!(true));
        assert_eq!(data["sessions"][0]["tab_id"], json!(9));
        assert_eq!(data["badge"], json!("muted"));
    }
}
