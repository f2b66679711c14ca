//! Configuration management for Sluice.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `SLUICE_`-prefixed environment variables (`SLUICE_BUCKET__CAPACITY=5`).
//! Configuration is read once at startup and never reloaded.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SluiceError};

/// Main configuration for the Sluice service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SluiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Leaky bucket configuration
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Upstream service configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Path of the rate limited route
    #[serde(default = "default_route")]
    pub route: String,

    /// Idle keep-alive timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Request body read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Timeout for producing the full response, in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            route: default_route(),
            idle_timeout_secs: default_idle_timeout(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

impl ServerConfig {
    /// Get the idle keep-alive timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get the request body read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Get the timeout for producing the full response.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_route() -> String {
    "/request".to_string()
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    10
}

/// Leaky bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum number of reserved, undrained slots
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Time between drain ticks in milliseconds
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            drain_interval_ms: default_drain_interval(),
        }
    }
}

impl BucketConfig {
    /// Get the time between drain ticks.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

fn default_capacity() -> usize {
    3
}

fn default_drain_interval() -> u64 {
    10_000
}

/// Upstream service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// URL fetched for every admitted request
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Upstream request timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

impl UpstreamConfig {
    /// Get the upstream request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_upstream_url() -> String {
    "https://httpbin.org".to_string()
}

fn default_upstream_timeout() -> u64 {
    10
}

impl SluiceConfig {
    /// Load configuration from defaults, an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        builder = builder.add_source(
            Environment::with_prefix("SLUICE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: SluiceConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SluiceConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.capacity == 0 {
            return Err(SluiceError::Config(
                "bucket.capacity must be greater than zero".to_string(),
            ));
        }
        if self.bucket.drain_interval_ms == 0 {
            return Err(SluiceError::Config(
                "bucket.drain_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !self.server.route.starts_with('/') {
            return Err(SluiceError::Config(format!(
                "server.route must start with '/', got {:?}",
                self.server.route
            )));
        }

        let timeouts = [
            ("server.idle_timeout_secs", self.server.idle_timeout_secs),
            ("server.read_timeout_secs", self.server.read_timeout_secs),
            ("server.write_timeout_secs", self.server.write_timeout_secs),
            ("upstream.timeout_secs", self.upstream.timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(SluiceError::Config(format!(
                "{} must be greater than zero",
                name
            )));
        }

        if self.upstream.url.trim().is_empty() {
            return Err(SluiceError::Config("upstream.url is required".to_string()));
        }

        Ok(())
    }
}
