//! Runtime configuration for the sync core.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Number of attempts a queued operation gets before it is dropped.
pub const MAX_RETRIES: u32 = 3;

/// Format tag written into every registry document.
pub const REGISTRY_FORMAT: &str = "memex-registry";

/// Registry schema version.
pub const REGISTRY_VERSION: u32 = 1;

/// Configuration for the sync core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemexConfig {
    /// Interval between cross-space propagation cycles (seconds).
    pub cross_space_interval_secs: u64,
    /// Base interval between offline queue drains (seconds).
    pub queue_retry_interval_secs: u64,
    /// Upper bound on the retry backoff, as a multiple of the base interval.
    pub max_backoff_multiplier: u32,
    /// Attempts before a queued operation is dropped.
    pub max_retries: u32,
    /// Timeout for a single content store or space call (ms).
    pub request_timeout_ms: u64,
    /// CID used for the gateway reachability probe.
    pub gateway_probe_cid: String,
    /// Replace author identity in published entries.
    pub anonymize_authors: bool,
}

impl Default for MemexConfig {
    fn default() -> Self {
        Self {
            cross_space_interval_secs: 30,
            queue_retry_interval_secs: 60,
            max_backoff_multiplier: 16,
            max_retries: MAX_RETRIES,
            request_timeout_ms: 30_000,
            gateway_probe_cid: "bafkqaaa".to_string(),
            anonymize_authors: false,
        }
    }
}

impl MemexConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::PersistenceFailure(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Cross-space cycle interval.
    pub fn cross_space_interval(&self) -> Duration {
        Duration::from_secs(self.cross_space_interval_secs.max(1))
    }

    /// Base offline queue retry interval.
    pub fn queue_retry_interval(&self) -> Duration {
        Duration::from_secs(self.queue_retry_interval_secs.max(1))
    }

    /// Per-call network timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
