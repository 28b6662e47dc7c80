//! Last-seen version counters.
//!
//! The server stamps signals with per-key version counters. The client
//! reports the counters it has seen in every connect frame so the server can
//! backfill what was missed.

use std::collections::HashMap;
use std::sync::Arc;

use tether_core::TetherResult;
use tracing::{debug, warn};

use crate::settings::SettingsStore;

const VERSION_PREFIX: &str = "VERSION.";

/// Version counter storage.
pub trait VersionStore: Send + Sync {
    /// Counter for `key`.
    fn get(&self, key: &str) -> Option<i64>;

    /// Record `value` for `key`.
    ///
    /// # Errors
    /// Propagates store write failures.
    fn set(&self, key: &str, value: i64) -> TetherResult<()>;

    /// Snapshot of every counter.
    fn all(&self) -> HashMap<String, i64>;

    /// Forget every counter.
    ///
    /// # Errors
    /// Propagates store write failures.
    fn clear(&self) -> TetherResult<()>;
}

/// [`VersionStore`] kept in a [`SettingsStore`] under `VERSION.<key>`.
///
/// Clearing the settings store (on an identity change) clears the counters
/// with it.
#[derive(Clone)]
pub struct SettingsVersionStore {
    settings: Arc<dyn SettingsStore>,
}

impl std::fmt::Debug for SettingsVersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsVersionStore").finish_non_exhaustive()
    }
}

impl SettingsVersionStore {
    /// Wrap `settings`.
    #[must_use]
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }
}

impl VersionStore for SettingsVersionStore {
    fn get(&self, key: &str) -> Option<i64> {
        let raw = self.settings.get(&format!("{VERSION_PREFIX}{key}"))?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, raw = %raw, "ignoring unparsable version counter");
                None
            }
        }
    }

    fn set(&self, key: &str, value: i64) -> TetherResult<()> {
        debug!(key, value, "version counter updated");
        self.settings
            .put(&format!("{VERSION_PREFIX}{key}"), &value.to_string())
    }

    fn all(&self) -> HashMap<String, i64> {
        self.settings
            .keys()
            .iter()
            .filter_map(|stored| stored.strip_prefix(VERSION_PREFIX))
            .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
            .collect()
    }

    fn clear(&self) -> TetherResult<()> {
        for stored in self.settings.keys() {
            if stored.starts_with(VERSION_PREFIX) {
                self.settings.remove(&stored)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_live_beside_identity() {
        let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
        settings.put("CLIENT_ID", "c-1").unwrap();
        let versions = SettingsVersionStore::new(Arc::clone(&settings));

        versions.set("device", 7).unwrap();
        versions.set("inbox", 12).unwrap();
        assert_eq!(versions.get("device"), Some(7));
        assert_eq!(
            versions.all(),
            HashMap::from([("device".to_string(), 7), ("inbox".to_string(), 12)])
        );

        versions.clear().unwrap();
        assert!(versions.all().is_empty());
        assert_eq!(settings.get("CLIENT_ID").as_deref(), Some("c-1"));
    }

    #[test]
    fn garbage_counter_is_skipped() {
        let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new());
        settings.put("VERSION.device", "seven").unwrap();
        let versions = SettingsVersionStore::new(settings);
        assert_eq!(versions.get("device"), None);
        assert!(versions.all().is_empty());
    }
}
