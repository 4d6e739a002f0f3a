//! Storage paths and the file-backed key-value store.
//!
//! `StorageConfig` centralizes every path under `~/.mutesync/`. Tests use
//! `StorageConfig::with_root(temp_dir)` for isolation.

use fs_err as fs;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::error::{MuteError, Result};
use crate::platform::KeyValueStore;

pub const SOCKET_ENV: &str = "MUTESYNC_DAEMON_SOCKET";

/// Central configuration for all mutesync storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    /// Points at `~/.mutesync`.
    pub fn resolve() -> Result<Self> {
        let home = dirs::home_dir().ok_or(MuteError::HomeDirNotFound)?;
        Ok(Self {
            root: home.join(".mutesync"),
        })
    }

    /// Creates a StorageConfig with a custom root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Unix socket the daemon listens on. `MUTESYNC_DAEMON_SOCKET` overrides it.
    pub fn socket_path(&self) -> PathBuf {
        match std::env::var_os(SOCKET_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => self.root.join("daemon.sock"),
        }
    }

    /// Persisted key-value storage (holds the Local Preference).
    pub fn storage_file(&self) -> PathBuf {
        self.root.join("storage.json")
    }

    /// Last painted badge, for external renderers.
    pub fn badge_file(&self) -> PathBuf {
        self.root.join("badge.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

/// Key-value store persisted as a single JSON object.
///
/// Every `set` rewrites the file atomically (temp file + rename), so a crash
/// mid-write leaves the previous contents intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => {
                return Err(MuteError::StorageRead(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    err
                )))
            }
        };

        match serde_json::from_slice::<Value>(&data) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(MuteError::StorageRead(format!(
                "{} does not hold a JSON object",
                self.path.display()
            ))),
            Err(err) => Err(MuteError::StorageRead(format!(
                "Failed to parse {}: {}",
                self.path.display(),
                err
            ))),
        }
    }

    fn save(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| MuteError::StorageWrite(format!("Failed to create dir: {}", err)))?;
        }

        let payload = serde_json::to_vec_pretty(map).map_err(|source| MuteError::Json {
            context: "serializing storage".to_string(),
            source,
        })?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .map_err(|err| MuteError::StorageWrite(format!("Failed to write storage: {}", err)))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|err| MuteError::StorageWrite(format!("Failed to commit storage: {}", err)))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let mut map = match self.load() {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(error = %err, "Discarding unreadable storage file");
                Map::new()
            }
        };
        map.insert(key.to_string(), value);
        self.save(&map)
    }
}
