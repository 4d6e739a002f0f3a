//! Local Preference: the last user-requested mute flag.
//!
//! Written optimistically on every toggle request and read back by the
//! safety-net repaint. Not authoritative for the badge; the registry's
//! aggregate state is.

use serde_json::Value;

use crate::error::{MuteError, Result};
use crate::platform::KeyValueStore;

pub const MUTED_KEY: &str = "muted";

pub struct LocalPreference {
    store: Box<dyn KeyValueStore>,
}

impl LocalPreference {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// `Ok(None)` when nothing has been stored yet.
    pub fn muted(&self) -> Result<Option<bool>> {
        match self.store.get(MUTED_KEY)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(muted)) => Ok(Some(muted)),
            Some(other) => Err(MuteError::StorageRead(format!(
                "{} holds a non-boolean value: {}",
                MUTED_KEY, other
            ))),
        }
    }

    /// Reads the flag, falling back to `false` on absence or failure.
    pub fn muted_or_default(&self) -> bool {
        match self.muted() {
            Ok(value) => value.unwrap_or(false),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read mute preference; assuming unmuted");
                false
            }
        }
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        self.store.set(MUTED_KEY, Value::Bool(muted))
    }
}
