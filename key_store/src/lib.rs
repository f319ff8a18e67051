//! Key persistence for aircast
//!
//! This crate stores the broadcast key and the listener authorization
//! record across process restarts. Persistence is a convenience, not a
//! correctness requirement: when the backing file is missing, unreadable
//! or cannot be resolved at all, loading degrades to the empty record and
//! the application simply re-authorizes.

use cast_core::{Error, SessionKey};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The persisted key record. Absent fields mean "never configured".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoredKeys {
    /// Key the broadcaster publishes under, generated once and reused
    #[serde(default)]
    pub broadcast_key: Option<SessionKey>,

    /// Whether this device has a listener that authorized successfully
    #[serde(default)]
    pub listener_authorized: bool,

    /// Key the listener authorized against
    #[serde(default)]
    pub listener_key: Option<SessionKey>,
}

/// TOML-backed store for [`StoredKeys`]. Pure read/replace, no merge logic.
pub struct KeyStore {
    key_file: Option<PathBuf>,
}

impl KeyStore {
    /// Create a store backed by `keys.toml` under the user's config
    /// directory. Falls back to a memory-only store when no config
    /// directory can be resolved.
    pub fn new() -> Self {
        let key_file = match dirs::config_dir() {
            Some(mut dir) => {
                dir.push("aircast");
                dir.push("keys.toml");
                Some(dir)
            }
            None => {
                warn!("Could not determine config directory, keys will not persist");
                None
            }
        };

        Self { key_file }
    }

    /// Create a store backed by a custom file path (mainly for testing)
    pub fn with_file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            key_file: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Create a memory-only store that never touches disk
    pub fn in_memory() -> Self {
        Self { key_file: None }
    }

    /// Whether saved keys survive a restart
    pub fn persistent(&self) -> bool {
        self.key_file.is_some()
    }

    /// Load the stored record. Any failure (no file, unreadable file,
    /// malformed contents) yields the empty record.
    pub fn load(&self) -> StoredKeys {
        let Some(path) = &self.key_file else {
            return StoredKeys::default();
        };

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("Key file not readable ({}), using empty record", e);
                return StoredKeys::default();
            }
        };

        match toml::from_str(&contents) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Key file {:?} is malformed ({}), using empty record", path, e);
                StoredKeys::default()
            }
        }
    }

    /// Replace the stored record. A memory-only store accepts the write
    /// and drops it.
    pub fn save(&self, keys: &StoredKeys) -> Result<(), Error> {
        let Some(path) = &self.key_file else {
            debug!("Key store is memory-only, skipping save");
            return Ok(());
        };

        let toml = toml::to_string_pretty(keys)
            .map_err(|e| Error::Store(format!("Failed to serialize keys: {}", e)))?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::Store(format!("Failed to create key directory: {}", e)))?;
            }
        }

        fs::write(path, toml)
            .map_err(|e| Error::Store(format!("Failed to write key file: {}", e)))?;

        debug!("Saved keys to {:?}", path);
        Ok(())
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}
