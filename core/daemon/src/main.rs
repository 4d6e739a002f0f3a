//! mutesync daemon entrypoint.
//!
//! The background process as a small single-writer service: a socket
//! listener, strict request validation, and one service thread that owns the
//! session registry, the Local Preference and the badge.
//!
//! A connection either carries one request and one response, or opens with
//! `connect` and then stays open as a tab's channel, one JSON object per line
//! in both directions.

use clap::Parser;
use fs_err as fs;
use std::env;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mutesync_core::{load_config, MuteConfig, StorageConfig};
use mutesync_protocol::{
    parse_connect, ErrorInfo, Method, Request, Response, TabId, TabMessage, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};

mod service;
mod surfaces;

use service::{ConnectionId, HostEvent, ServiceHost};

const READ_TIMEOUT_SECS: u64 = 2;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Parser)]
#[command(name = "mutesync-daemon")]
#[command(about = "Background process owning mutesync sessions and the badge")]
#[command(version)]
struct Args {
    /// Config file (defaults to ~/.mutesync/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    init_logging();

    let storage = match StorageConfig::resolve() {
        Ok(storage) => storage,
        Err(err) => {
            error!(error = %err, "Failed to resolve mutesync storage");
            std::process::exit(1);
        }
    };
    if let Err(err) = storage.ensure_dirs() {
        error!(error = %err, "Failed to prepare mutesync directory");
        std::process::exit(1);
    }

    let socket_path = storage.socket_path();
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let config_path = args.config.unwrap_or_else(|| storage.config_path());
    let config = match load_config(Some(config_path.clone())) {
        Ok(config) => config,
        Err(err) => {
            warn!(
                error = %err,
                path = %config_path.display(),
                "Failed to load config; using defaults"
            );
            MuteConfig::default()
        }
    };
    info!(
        path = %socket_path.display(),
        patterns = ?config.page.url_patterns,
        shortcut = %config.page.shortcut,
        "mutesync daemon started"
    );

    let (events, inbox) = mpsc::channel();
    thread::spawn(move || ServiceHost::new(config, &storage).run(inbox));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let events = events.clone();
                thread::spawn(move || handle_connection(stream, events));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("MUTESYNC_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(stream: UnixStream, events: Sender<HostEvent>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            warn!(error = %err, "Failed to clone daemon connection");
            return;
        }
    };
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));
    let mut reader = BufReader::new(stream);

    let request = match read_request(&mut reader) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let _ = write_response(&mut writer, &Response::error_with_info(None, err));
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.method == Method::Connect && request.protocol_version == PROTOCOL_VERSION {
        run_channel(request, reader, writer, events);
        return;
    }

    let (reply, response) = mpsc::channel();
    let id = request.id.clone();
    let response = if events.send(HostEvent::Request { request, reply }).is_ok() {
        response.recv().unwrap_or_else(|_| service_unavailable(id))
    } else {
        service_unavailable(id)
    };
    let _ = write_response(&mut writer, &response);
}

fn service_unavailable(id: Option<String>) -> Response {
    Response::error(id, "service_unavailable", "service loop is not running")
}

/// Serves a tab's persistent channel until either side closes it.
fn run_channel(
    request: Request,
    mut reader: BufReader<UnixStream>,
    mut writer: UnixStream,
    events: Sender<HostEvent>,
) {
    let params = match parse_connect(request.params) {
        Ok(params) => params,
        Err(err) => {
            warn!(code = %err.code, "Rejected channel");
            let _ = write_response(&mut writer, &Response::error_with_info(request.id, err));
            return;
        }
    };

    let tab_id = params.tab_id;
    let connection: ConnectionId = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    let opened = HostEvent::Connect {
        connection,
        id: request.id,
        params,
        stream: writer,
    };
    if events.send(opened).is_err() {
        return;
    }

    let _ = reader.get_ref().set_read_timeout(None);
    loop {
        match read_line(&mut reader) {
            Ok(Some(line)) => match parse_channel_message(&line) {
                Ok(message) => {
                    let event = HostEvent::ChannelMessage {
                        connection,
                        tab_id,
                        message,
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Err(err) => warn!(tab_id, code = %err.code, message = %err.message, "Bad channel message"),
            },
            Ok(None) => break,
            Err(err) => {
                warn!(tab_id, code = %err.code, message = %err.message, "Channel read failed");
                break;
            }
        }
    }

    debug!(tab_id, connection, "Channel closed");
    let _ = events.send(HostEvent::ChannelClosed { connection, tab_id });
}

fn parse_channel_message(line: &str) -> Result<TabMessage, ErrorInfo> {
    serde_json::from_str(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("channel message was not valid: {}", err),
        )
    })
}

fn read_request(reader: &mut BufReader<UnixStream>) -> Result<Request, ErrorInfo> {
    let line = read_line(reader)?
        .ok_or_else(|| ErrorInfo::new("empty_request", "request body was empty"))?;

    serde_json::from_str(&line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

/// Reads the next non-blank line. `Ok(None)` at end of stream.
fn read_line(reader: &mut BufReader<UnixStream>) -> Result<Option<String>, ErrorInfo> {
    loop {
        let mut line = String::new();
        let read = reader
            .by_ref()
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_line(&mut line);
        match read {
            Ok(0) => return Ok(None),
            Ok(n) if n > MAX_REQUEST_BYTES => {
                return Err(ErrorInfo::new(
                    "request_too_large",
                    "request exceeded maximum size",
                ));
            }
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                return Ok(Some(line.trim_end().to_string()));
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }
}

fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    use std::io::Write;

    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
