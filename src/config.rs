use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the metrika pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Frame processing configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Presence aggregation configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Subscriber identity resolution configuration.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Backing store connection configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Frame processing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the inbound frame channel. Default: 65536.
    #[serde(default = "default_frame_channel_capacity")]
    pub frame_channel_capacity: usize,

    /// Maximum concurrently in-flight classify+write tasks. Default: 64.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

/// Presence aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Aggregation cycle interval. Default: 60s.
    #[serde(default = "default_presence_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Also build network-scoped presence counts. Default: true.
    #[serde(default = "default_true")]
    pub by_network: bool,
}

/// Subscriber identity resolution configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Identity cache URL (e.g. "redis://127.0.0.1/").
    #[serde(default)]
    pub cache_url: String,

    /// Hash holding subscriber records, keyed by raw id. Default: "subscribers".
    #[serde(default = "default_cache_hash_key")]
    pub cache_hash_key: String,
}

/// Backing store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "telemetry".
    #[serde(default = "default_database")]
    pub database: String,

    /// Store username.
    #[serde(default)]
    pub username: String,

    /// Store password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_frame_channel_capacity() -> usize {
    65536
}

fn default_max_inflight() -> usize {
    64
}

fn default_presence_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_cache_hash_key() -> String {
    "subscribers".to_string()
}

fn default_database() -> String {
    "telemetry".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            pipeline: PipelineConfig::default(),
            presence: PresenceConfig::default(),
            identity: IdentityConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_channel_capacity: default_frame_channel_capacity(),
            max_inflight: default_max_inflight(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            interval: default_presence_interval(),
            by_network: true,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_url: String::new(),
            cache_hash_key: default_cache_hash_key(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store.endpoint.is_empty() {
            bail!("store.endpoint is required");
        }

        if self.identity.cache_url.is_empty() {
            bail!("identity.cache_url is required");
        }

        if self.identity.cache_hash_key.is_empty() {
            bail!("identity.cache_hash_key must not be empty");
        }

        if self.pipeline.frame_channel_capacity == 0 {
            bail!("pipeline.frame_channel_capacity must be positive");
        }

        if self.pipeline.max_inflight == 0 {
            bail!("pipeline.max_inflight must be positive");
        }

        if self.presence.interval.is_zero() {
            bail!("presence.interval must be positive");
        }

        Ok(())
    }
}
