//! Settings for every subsystem, loadable from a JSON file.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::SettingsError;
use crate::graph::Identity;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub merge: MergeOptions,
    pub patch: PatchOptions,
    pub queue: QueueOptions,
    pub cache: CacheOptions,
}

impl Settings {
    pub fn from_path(path: &Utf8Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|e| SettingsError::Io(path.to_owned(), e))?;
        serde_json::from_str(&text).map_err(|e| SettingsError::Json(path.to_owned(), e))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    /// Keep going when targets fail to configure, returning the errors.
    pub continue_on_failure: bool,
    pub identity: Identity,
    pub source_root: Utf8PathBuf,
    pub build_root: Utf8PathBuf,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            continue_on_failure: false,
            identity: Identity::Content,
            source_root: Utf8PathBuf::from("."),
            build_root: Utf8PathBuf::from("build"),
        }
    }
}

impl MergeOptions {
    pub fn with_continue_on_failure(mut self, value: bool) -> Self {
        self.continue_on_failure = value;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_source_root(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.source_root = path.into();
        self
    }

    pub fn with_build_root(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.build_root = path.into();
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatchOptions {
    /// JSON map from processor class to the directory holding its artifacts.
    pub processors_file: Option<Utf8PathBuf>,
    /// Where per-version toolchain symlinks are kept.
    pub toolchain_cache_dir: Utf8PathBuf,
    /// Directory searched for provisioned toolchains.
    pub toolchain_root: Utf8PathBuf,
    /// Name prefix of toolchain directories, followed by the version.
    pub toolchain_prefix: String,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            processors_file: None,
            toolchain_cache_dir: Utf8PathBuf::from(".forge/jdk"),
            toolchain_root: Utf8PathBuf::from(".forge/resources"),
            toolchain_prefix: "jdk".to_string(),
        }
    }
}

impl PatchOptions {
    pub fn with_processors_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.processors_file = Some(path.into());
        self
    }

    pub fn with_toolchain_cache_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.toolchain_cache_dir = path.into();
        self
    }

    pub fn with_toolchain_root(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.toolchain_root = path.into();
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub root: Utf8PathBuf,
    /// Chunks kept by `cleanup`, oldest removed first.
    pub max_items: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from(".forge/events"),
            max_items: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Attempts per call, the first one included.
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    /// Upper bound for a single remote call.
    pub timeout_ms: Option<u64>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_interval_ms: 500,
            timeout_ms: None,
        }
    }
}

impl CacheOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
