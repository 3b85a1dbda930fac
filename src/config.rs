use std::{fs, path::Path, str::FromStr};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub browser: Option<BrowserConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    pub path: std::path::PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub cap: StorageCapClass,
    #[serde(default)]
    pub default_scope: ClipScope,
    #[serde(default = "default_true")]
    pub sanitize_url_params: bool,
    #[serde(default)]
    pub custom_header_patterns: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            paused: false,
            cap: StorageCapClass::default(),
            default_scope: ClipScope::default(),
            sanitize_url_params: true,
            custom_header_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub endpoint_url: String,
    pub endpoint_key: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BrowserConfig {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Discrete ceilings for total on-disk buffer usage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageCapClass {
    #[serde(rename = "100MB")]
    Mb100,
    #[serde(rename = "250MB")]
    Mb250,
    #[default]
    #[serde(rename = "500MB")]
    Mb500,
    #[serde(rename = "1GB")]
    Gb1,
    #[serde(rename = "2GB")]
    Gb2,
}

impl StorageCapClass {
    pub fn bytes(self) -> u64 {
        match self {
            Self::Mb100 => 100 * 1024 * 1024,
            Self::Mb250 => 250 * 1024 * 1024,
            Self::Mb500 => 500 * 1024 * 1024,
            Self::Gb1 => 1024 * 1024 * 1024,
            Self::Gb2 => 2 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClipScope {
    #[default]
    CurrentTab,
    SelectTabs,
    AllTabs,
}

fn default_true() -> bool {
    true
}

fn default_bucket() -> String {
    "clips".to_owned()
}

/// Snapshot of the runtime-mutable settings. Readers always observe a
/// consistent snapshot per call.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    pub paused: bool,
    pub cap: StorageCapClass,
    pub default_scope: ClipScope,
    pub sanitize_url_params: bool,
    pub custom_header_patterns: Vec<String>,
    pub remote: Option<RemoteConfig>,
}

/// Process-wide reactive settings. Writes go through the watch channel so
/// observers (capture attach cycle, buffer passes) see every edge.
#[derive(Debug, Clone)]
pub struct Settings {
    tx: watch::Sender<SettingsSnapshot>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        let snapshot = SettingsSnapshot {
            paused: config.capture.paused,
            cap: config.capture.cap,
            default_scope: config.capture.default_scope,
            sanitize_url_params: config.capture.sanitize_url_params,
            custom_header_patterns: config.capture.custom_header_patterns.clone(),
            remote: config.remote.clone(),
        };
        let (tx, _rx) = watch::channel(snapshot);
        Self { tx }
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SettingsSnapshot> {
        self.tx.subscribe()
    }

    pub fn set_paused(&self, paused: bool) {
        self.tx.send_if_modified(|snapshot| {
            let changed = snapshot.paused != paused;
            snapshot.paused = paused;
            changed
        });
    }

    pub fn set_cap(&self, cap: StorageCapClass) {
        self.tx.send_if_modified(|snapshot| {
            let changed = snapshot.cap != cap;
            snapshot.cap = cap;
            changed
        });
    }

    pub fn cap_bytes(&self) -> u64 {
        self.tx.borrow().cap.bytes()
    }
}
