//! Last-page recovery key
//!
//! One small JSON file remembering which page was last fetched, so a
//! restarted client can ask for it again. Not a session store.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Page type stored when a pagelet request fails
pub const HOME_PAGE: &str = "home";

/// The stored key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryKey {
    /// Epoch milliseconds when the page was shown
    pub timestamp: i64,
    pub page_type: String,
}

impl RecoveryKey {
    /// Key for a page shown now
    pub fn now(page_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            page_type: page_type.into(),
        }
    }

    /// Age relative to `now_ms`; keys from the future count as fresh
    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp).max(0) as u64)
    }
}

/// File-backed store for the recovery key
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    path: PathBuf,
}

/// Errors reading or writing the key
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecoveryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the key; a missing file is `Ok(None)`
    pub fn load(&self) -> Result<Option<RecoveryKey>, RecoveryError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the key if it is younger than `max_age`
    pub fn load_fresh(&self, max_age: Duration) -> Result<Option<RecoveryKey>, RecoveryError> {
        let now = Utc::now().timestamp_millis();
        Ok(self.load()?.filter(|key| key.age(now) <= max_age))
    }

    /// Overwrite the key
    pub fn save(&self, key: &RecoveryKey) -> Result<(), RecoveryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string(key)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Remove the key; removing a missing key is not an error
    pub fn clear(&self) -> Result<(), RecoveryError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
