//! Configuration management for the thmond daemon.
//!
//! Loads one document that names the acquisition module, the wait interval
//! and any number of output sinks. Module settings stay untyped until the
//! module itself parses them, so a broken sink section cannot reject the
//! whole document.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

use crate::outcome::ModuleError;

/// Main configuration structure for the thmond daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// interval_secs: 3
///
/// collection:
///   kind: sht31
///   device: /dev/i2c-1
///   address: 68
///
/// post_collection:
///   - kind: segment-display
///     cadence_ms: 100
///     data_pin: 17
///     clock_pin: 27
///     latch_pin: 22
///     chain_num: 2
///     gpiochip_path: /dev/gpiochip0
///   - kind: mqtt
///     host: broker.local
///     topic: home/thmond
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Wait between acquisitions in seconds.
    #[serde(default = "defaults::interval_secs")]
    pub interval_secs: u64,

    /// The mandatory acquisition module.
    pub collection: ModuleCfg,

    /// Output sinks, run in the listed order.
    #[serde(default)]
    pub post_collection: Vec<ModuleCfg>,
}

/// One module entry: a kind tag plus module-private settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleCfg {
    pub kind: String,

    /// When set, a sink runs as a detached consumer on this cadence instead
    /// of after each successful acquisition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence_ms: Option<u64>,

    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ModuleCfg {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            cadence_ms: None,
            settings: Map::new(),
        }
    }

    /// Adds one setting; used when building entries in code.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    pub fn cadence(&self) -> Option<Duration> {
        self.cadence_ms.map(Duration::from_millis)
    }

    /// Parses the settings into the module's typed settings struct.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T, ModuleError> {
        serde_json::from_value(Value::Object(self.settings.clone()))
            .map_err(|e| ModuleError::config(format!("{}: {e}", self.kind)))
    }
}

impl Config {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Validates the document shape; module settings are checked by each
    /// module's own initialization.
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            anyhow::bail!("Unsupported config version {}", self.version);
        }
        if self.interval_secs == 0 {
            anyhow::bail!("interval_secs must be greater than zero");
        }
        for module in std::iter::once(&self.collection).chain(&self.post_collection) {
            if module.kind.trim().is_empty() {
                anyhow::bail!("Module entry with empty kind");
            }
            if module.cadence_ms == Some(0) {
                anyhow::bail!("Module '{}' has a zero cadence_ms", module.kind);
            }
        }
        if self.collection.cadence_ms.is_some() {
            anyhow::bail!("cadence_ms is only meaningful for post_collection entries");
        }
        Ok(())
    }
}

mod defaults {
    /// Default acquisition interval in seconds.
    pub fn interval_secs() -> u64 {
        3
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var("THMOND_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("thmond/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/thmond/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    anyhow::bail!("Configuration file not found in any standard location")
}

/// Holds the loaded configuration and where it came from.
///
/// # Example
///
/// ```no_run
/// use thmond::config::ConfigManager;
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(Some(PathBuf::from("config.yml"))).await?;
/// let interval = config_manager.get().await.interval();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. THMOND_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/thmond/config.yml or ~/.config/thmond/config.yml
    /// 4. /etc/thmond/config.yml
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path).await?;

        Ok(Self::new(config, config_path))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    async fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON in: {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?
        };

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
