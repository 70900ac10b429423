use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use super::paths::{resolve_cache_location, CacheLocation};

pub const DEFAULT_BASE_URL: &str = "https://api.wandb.ai";
pub const DEFAULT_STORAGE_REGION: &str = "default";
pub const STORAGE_POLICY_NAME: &str = "wandb-storage-policy-v1";

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        matches!(
            self.var(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.var(key).map(str::trim).filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("{key} has an invalid value: {raw}")),
            None => Ok(default),
        }
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Process-wide settings shared by every artifact.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) cache: CacheLocation,
    pub(crate) base_url: String,
    pub(crate) storage: PolicyConfig,
    pub(crate) manifest_backing: ManifestBacking,
    pub(crate) batch: BatchSettings,
    pub(crate) transfer: TransferSettings,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if the cache root cannot be resolved or a tuning
    /// variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let storage_layout = if snapshot.flag_is_enabled("ARTSTORE_USE_V1_ARTIFACTS") {
            StorageLayout::V1
        } else {
            StorageLayout::V2
        };
        let storage_region = snapshot
            .var("ARTSTORE_STORAGE_REGION")
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_STORAGE_REGION)
            .to_string();
        let manifest_backing = match snapshot.var("ARTSTORE_MANIFEST_BACKING") {
            Some(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => ManifestBacking::Auto,
        };
        let defaults = BatchSettings::default();
        Ok(Self {
            cache: resolve_cache_location(snapshot)?,
            base_url: snapshot
                .var("ARTSTORE_BASE_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            storage: PolicyConfig {
                storage_layout,
                storage_region,
            },
            manifest_backing,
            batch: BatchSettings {
                batch_time: Duration::from_millis(
                    snapshot.parsed("ARTSTORE_BATCH_TIME_MS", millis(defaults.batch_time))?,
                ),
                inter_event_time: Duration::from_millis(snapshot.parsed(
                    "ARTSTORE_INTER_EVENT_TIME_MS",
                    millis(defaults.inter_event_time),
                )?),
                max_batch_size: snapshot
                    .parsed("ARTSTORE_MAX_BATCH_SIZE", defaults.max_batch_size)?
                    .max(1),
            },
            transfer: TransferSettings::default(),
        })
    }

    /// Defaults rooted at an explicit cache directory, ignoring the
    /// environment.
    #[must_use]
    pub fn with_cache_root(root: impl Into<PathBuf>) -> Self {
        Self {
            cache: CacheLocation {
                path: root.into(),
                source: "explicit",
            },
            base_url: DEFAULT_BASE_URL.to_string(),
            storage: PolicyConfig {
                storage_layout: StorageLayout::V2,
                storage_region: DEFAULT_STORAGE_REGION.to_string(),
            },
            manifest_backing: ManifestBacking::Auto,
            batch: BatchSettings::default(),
            transfer: TransferSettings::default(),
        }
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: PolicyConfig) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn manifest_backing(mut self, backing: ManifestBacking) -> Self {
        self.manifest_backing = backing;
        self
    }

    #[must_use]
    pub fn batch(mut self, batch: BatchSettings) -> Self {
        self.batch = batch;
        self
    }

    #[must_use]
    pub fn transfer(mut self, transfer: TransferSettings) -> Self {
        self.transfer = transfer;
        self
    }

    #[must_use]
    pub fn cache(&self) -> &CacheLocation {
        &self.cache
    }

    #[must_use]
    pub fn backend_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn storage_config(&self) -> &PolicyConfig {
        &self.storage
    }

    #[must_use]
    pub fn backing(&self) -> ManifestBacking {
        self.manifest_backing
    }

    #[must_use]
    pub fn batch_settings(&self) -> &BatchSettings {
        &self.batch
    }

    #[must_use]
    pub fn transfer_settings(&self) -> &TransferSettings {
        &self.transfer
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// URL layout of stored files in the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageLayout {
    /// `{base}/artifacts/{entity}/{md5}`
    #[default]
    V1,
    /// `{base}/artifactsV2/{region}/{entity}/{birth artifact}/{md5}`
    V2,
}

/// The storage policy's configuration map as it appears in manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(default)]
    pub storage_layout: StorageLayout,
    #[serde(default = "default_region")]
    pub storage_region: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            storage_layout: StorageLayout::default(),
            storage_region: default_region(),
        }
    }
}

fn default_region() -> String {
    DEFAULT_STORAGE_REGION.to_string()
}

/// Which manifest backing to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ManifestBacking {
    /// SQLite when the linked engine supports it, memory otherwise.
    #[default]
    Auto,
    Sqlite,
    Memory,
}

impl FromStr for ManifestBacking {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "sqlite" | "sql" => Ok(Self::Sqlite),
            "memory" | "in-memory" | "in_memory" => Ok(Self::Memory),
            other => Err(anyhow!(
                "unknown manifest backing \"{other}\" (expected auto, sqlite or memory)"
            )),
        }
    }
}

/// Tuning of the upload-prepare batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_time: Duration,
    pub inter_event_time: Duration,
    pub max_batch_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_time: Duration::from_secs(1),
            inter_event_time: Duration::from_millis(50),
            max_batch_size: 1000,
        }
    }
}

/// Retry and pooling limits for byte transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub max_attempts: usize,
    pub backoff_base: Duration,
    pub pool_size: usize,
    pub timeout: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            backoff_base: Duration::from_secs(1),
            pool_size: 64,
            timeout: Duration::from_secs(60),
        }
    }
}
