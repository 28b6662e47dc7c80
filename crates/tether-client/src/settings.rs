//! Key-value settings holding the session identity.
//!
//! Stores are safe for concurrent use but offer no multi-key transactions.
//! Callers that read, decide, and write several keys hold their own lock
//! across the sequence.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tether_core::{TetherError, TetherResult};
use tracing::debug;

/// Well-known settings keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsKey {
    /// Client id assigned by the server.
    ClientId,
    /// API session the client id is subscribed for.
    SessionKey,
    /// Client id whose subscription the server last confirmed.
    LastSubscribedClientId,
    /// Whether a subscription confirmation is outstanding (`"true"`/`"false"`).
    ExpectsSubscriptionComplete,
}

impl SettingsKey {
    /// Stored key name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientId => "CLIENT_ID",
            Self::SessionKey => "SESSION_KEY",
            Self::LastSubscribedClientId => "LAST_SUBSCRIBED_CLIENT_ID",
            Self::ExpectsSubscriptionComplete => "EXPECTS_SUBSCRIPTION_COMPLETE",
        }
    }
}

impl fmt::Display for SettingsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String key-value store.
pub trait SettingsStore: Send + Sync {
    /// Value for `key`, or `None` when absent.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`.
    ///
    /// # Errors
    /// Returns an I/O error if a persistent store cannot be written.
    fn put(&self, key: &str, value: &str) -> TetherResult<()>;

    /// Remove `key`.
    ///
    /// # Errors
    /// Returns an I/O error if a persistent store cannot be written.
    fn remove(&self, key: &str) -> TetherResult<()>;

    /// Remove every key.
    ///
    /// # Errors
    /// Returns an I/O error if a persistent store cannot be written.
    fn clear(&self) -> TetherResult<()>;

    /// Every stored key.
    fn keys(&self) -> Vec<String>;
}

/// Typed access to [`SettingsKey`] entries.
pub trait SettingsStoreExt {
    /// Value for `key`, treating an empty string as absent.
    fn value(&self, key: SettingsKey) -> Option<String>;

    /// Store `value` under `key`.
    ///
    /// # Errors
    /// Propagates store write failures.
    fn set(&self, key: SettingsKey, value: &str) -> TetherResult<()>;

    /// Boolean flag; absent or unparsable reads as `false`.
    fn flag(&self, key: SettingsKey) -> bool;

    /// Store a boolean flag.
    ///
    /// # Errors
    /// Propagates store write failures.
    fn set_flag(&self, key: SettingsKey, value: bool) -> TetherResult<()>;
}

impl<S: SettingsStore + ?Sized> SettingsStoreExt for S {
    fn value(&self, key: SettingsKey) -> Option<String> {
        self.get(key.as_str()).filter(|value| !value.is_empty())
    }

    fn set(&self, key: SettingsKey, value: &str) -> TetherResult<()> {
        self.put(key.as_str(), value)
    }

    fn flag(&self, key: SettingsKey) -> bool {
        self.get(key.as_str())
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    fn set_flag(&self, key: SettingsKey, value: bool) -> TetherResult<()> {
        self.put(key.as_str(), if value { "true" } else { "false" })
    }
}

/// Volatile in-memory store.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettingsStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> TetherResult<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> TetherResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> TetherResult<()> {
        self.values.lock().clear();
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.values.lock().keys().cloned().collect()
    }
}

/// Store persisted as a JSON object.
///
/// Every mutation rewrites the file through a temporary sibling that is then
/// renamed over the original, so readers never see a torn file.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSettingsStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    /// Returns an I/O error for unreadable files and a config error for
    /// files that are not a JSON object of strings.
    pub fn open(path: impl Into<PathBuf>) -> TetherResult<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                TetherError::Config(format!("invalid settings file {}: {e}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(path = %path.display(), keys = values.len(), "settings store opened");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> TetherResult<()> {
        let encoded = serde_json::to_vec_pretty(values)
            .map_err(|e| TetherError::Io(format!("failed to encode settings: {e}")))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        {
            let mut file = fs::File::create(&staging)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    fn mutate(&self, change: impl FnOnce(&mut BTreeMap<String, String>)) -> TetherResult<()> {
        let mut values = self.values.lock();
        let mut staged = values.clone();
        change(&mut staged);
        self.persist(&staged)?;
        *values = staged;
        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> TetherResult<()> {
        self.mutate(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> TetherResult<()> {
        self.mutate(|values| {
            values.remove(key);
        })
    }

    fn clear(&self) -> TetherResult<()> {
        self.mutate(BTreeMap::clear)
    }

    fn keys(&self) -> Vec<String> {
        self.values.lock().keys().cloned().collect()
    }
}
