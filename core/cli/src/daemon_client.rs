//! Client helpers for talking to the mutesync daemon.
//!
//! One-shot requests open a connection, write one line and read one line.
//! Channels (`open_channel`) keep the connection for tab traffic.

use mutesync_core::StorageConfig;
use mutesync_protocol::{
    Method, Request, Response, TabId, TabMessage, ToggleSource, MAX_REQUEST_BYTES,
};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;

pub fn socket_path() -> Result<PathBuf, String> {
    let storage = StorageConfig::resolve().map_err(|err| err.to_string())?;
    Ok(storage.socket_path())
}

pub fn toggle(source: ToggleSource) -> Result<Value, String> {
    call(Method::ToggleMute, Some(json!({ "source": source })))
}

pub fn command(name: &str) -> Result<Value, String> {
    call(Method::Command, Some(json!({ "name": name })))
}

pub fn state() -> Result<Value, String> {
    call(Method::GetState, None)
}

pub fn health() -> Result<Value, String> {
    call(Method::GetHealth, None)
}

/// One-shot tab message, for when no channel is open.
pub fn tab_message(tab_id: TabId, url: &str, message: &TabMessage) -> Result<Value, String> {
    call(
        Method::TabMessage,
        Some(json!({ "tab_id": tab_id, "url": url, "message": message })),
    )
}

fn call(method: Method, params: Option<Value>) -> Result<Value, String> {
    let response = send_request(Request::new(method, Some(request_id(method)), params))?;
    into_data(response)
}

fn request_id(method: Method) -> String {
    let name = serde_json::to_value(method)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| "request".to_string());
    format!("{}-{}", name, std::process::id())
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string()))
    }
}

pub fn send_request(request: Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    write_json_line(&mut stream, &request)?;
    read_json_line(&mut BufReader::new(stream))
}

/// A tab's open channel to the daemon. Reads and writes go through separate
/// handles so a reader thread can own `reader`.
pub struct Channel {
    pub writer: UnixStream,
    pub reader: BufReader<UnixStream>,
}

pub fn open_channel(tab_id: TabId, url: &str, port_name: &str) -> Result<Channel, String> {
    let socket = socket_path()?;
    let mut writer = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let read_half = writer
        .try_clone()
        .map_err(|err| format!("Failed to clone channel: {}", err))?;
    let _ = read_half.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let mut reader = BufReader::new(read_half);

    let request = Request::new(
        Method::Connect,
        Some(format!("connect-{}", tab_id)),
        Some(json!({ "tab_id": tab_id, "url": url, "port_name": port_name })),
    );
    write_json_line(&mut writer, &request)?;
    let ack: Response = read_json_line(&mut reader)?;
    into_data(ack)?;

    let _ = reader.get_ref().set_read_timeout(None);
    Ok(Channel { writer, reader })
}

pub fn write_json_line<T: serde::Serialize>(stream: &mut UnixStream, value: &T) -> Result<(), String> {
    let mut payload =
        serde_json::to_vec(value).map_err(|err| format!("Failed to serialize: {}", err))?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .and_then(|_| stream.flush())
        .map_err(|err| format!("Failed to write to daemon: {}", err))
}

/// Reads one line and parses it. End of stream is an error.
pub fn read_json_line<T: serde::de::DeserializeOwned>(
    reader: &mut BufReader<UnixStream>,
) -> Result<T, String> {
    let mut line = String::new();
    let read = reader
        .by_ref()
        .take(MAX_REQUEST_BYTES as u64 + 1)
        .read_line(&mut line);
    match read {
        Ok(0) => Err("Daemon closed the connection".to_string()),
        Ok(n) if n > MAX_REQUEST_BYTES => Err("Response exceeded maximum size".to_string()),
        Ok(_) => serde_json::from_str(line.trim_end())
            .map_err(|err| format!("Failed to parse response JSON: {}", err)),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            Err("Timed out waiting for daemon response".to_string())
        }
        Err(err) => Err(format!("Failed to read response: {}", err)),
    }
}
