//! # Application Configuration
//!
//! One JSON document configures the whole binary:
//!
//! - [`ProxyConfig`]: tee buffering, manifest caching waits, in-flight dedupe
//! - [`UpstreamConfig`]: the registry the proxy project mirrors
//! - [`StorageConfig`]: where the local store keeps its files
//!
//! Every section and field is optional:
//!
//! ```json
//! {
//!   "upstream": { "url": "https://mirror.gcr.io" },
//!   "storage": { "data_dir": "/var/lib/pullcache" }
//! }
//! ```

use anyhow::{Context, Result};
use pullcache_core::ProxyConfig;
use pullcache_registry::UpstreamConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the filesystem store
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file (fails if the file doesn't exist)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .proxy
            .validate()
            .with_context(|| format!("Invalid proxy settings in {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a JSON file, falling back to defaults if it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
