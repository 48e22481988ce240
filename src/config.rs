// src/config.rs

//! Control-plane configuration: loading, defaults, and validation.

use crate::core::cluster::topology::RedisUri;
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            http: HttpConfig::default(),
            cluster: ClusterConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Settings for the HTTP task ingress.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// If false, only the library entry point accepts tasks.
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

/// Settings for reaching the managed cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Seed nodes used to discover the topology.
    #[serde(default)]
    pub seed_servers: Vec<String>,
    /// Port assumed when a task target or seed address omits one.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Cadence of the periodic topology refresh.
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    pub refresh_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seed_servers: Vec::new(),
            server_port: default_server_port(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

/// Timing knobs of the task pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// How long to sleep after a mutation before re-reading the topology.
    #[serde(with = "humantime_serde", default = "default_refresh_timeout")]
    pub refresh_timeout: Duration,
    /// How long the add/remove stages hold a batch open.
    #[serde(with = "humantime_serde", default = "default_batch_period")]
    pub batch_period: Duration,
    /// Minimum spacing between consecutive reshards.
    #[serde(with = "humantime_serde", default = "default_reshard_interval")]
    pub reshard_interval: Duration,
    /// Deadline for a whole reshard.
    #[serde(with = "humantime_serde", default = "default_reshard_timeout")]
    pub reshard_timeout: Duration,
    /// Deadline for moving the keys of a single slot.
    #[serde(with = "humantime_serde", default = "default_migrate_slot_timeout")]
    pub migrate_slot_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: default_refresh_timeout(),
            batch_period: default_batch_period(),
            reshard_interval: default_reshard_interval(),
            reshard_timeout: default_reshard_timeout(),
            migrate_slot_timeout: default_migrate_slot_timeout(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_http_enabled() -> bool {
    true
}
fn default_http_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    9001
}
fn default_server_port() -> u16 {
    6379
}
fn default_refresh_interval() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_refresh_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_batch_period() -> Duration {
    Duration::from_secs(5)
}
fn default_reshard_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_reshard_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_migrate_slot_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.seed_servers.is_empty() {
            return Err(anyhow!("cluster.seed_servers cannot be empty"));
        }
        if self.cluster.server_port == 0 {
            return Err(anyhow!("cluster.server_port cannot be 0"));
        }
        for seed in &self.cluster.seed_servers {
            RedisUri::parse(seed, self.cluster.server_port)
                .map_err(|e| anyhow!("invalid seed server '{seed}': {e}"))?;
        }
        if self.http.enabled && self.http.port == 0 {
            return Err(anyhow!("http.port cannot be 0 when the ingress is enabled"));
        }
        if self.pipeline.reshard_timeout < self.pipeline.migrate_slot_timeout {
            return Err(anyhow!(
                "pipeline.reshard_timeout must be at least pipeline.migrate_slot_timeout"
            ));
        }
        Ok(())
    }
}
