//! # Proxy Configuration
//!
//! Tuning knobs of the proxy controller. Every field has a default, so a
//! partial JSON document is enough:
//!
//! ```json
//! {
//!   "stream_buffer_chunks": 16,
//!   "manifest_wait_attempts": 5
//! }
//! ```

use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Chunks each side of a tee may buffer before the upstream read pauses
    pub stream_buffer_chunks: usize,
    /// How many times to poll for missing blobs before giving up on caching a manifest
    pub manifest_wait_attempts: u32,
    /// Delay between dependency polls, in milliseconds
    pub manifest_wait_interval_ms: u64,
    /// Let only one concurrent request write the cache for a given digest
    pub dedupe_inflight_blobs: bool,
    /// Capacity of the registry event queue
    pub event_buffer: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            stream_buffer_chunks: 8,
            manifest_wait_attempts: 10,
            manifest_wait_interval_ms: 20_000,
            dedupe_inflight_blobs: true,
            event_buffer: 256,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> ProxyResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: ProxyConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file, falling back to defaults if it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> ProxyResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.stream_buffer_chunks == 0 {
            return Err(ProxyError::Internal(
                "stream_buffer_chunks must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ProxyError::Internal(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn manifest_wait_interval(&self) -> Duration {
        Duration::from_millis(self.manifest_wait_interval_ms)
    }
}
