//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`--config`, or the first of the default paths that exists)
//! - Environment variables (`ASTRON_BIND`, `ASTRON_UPSTREAM`) as defaults
//! - Command line flags, which override both

use crate::cli::CliArgs;
use anyhow::{Context, Result};
use astron_core::DirectorConfig;
use astron_transport::TcpConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Paths searched when no `--config` is given.
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "astrond.toml",
    "/etc/astron/astrond.toml",
    "~/.config/astron/astrond.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub messagedirector: MessageDirectorConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Message director settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDirectorConfig {
    /// Address to accept participants on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Parent MD to connect to. Empty for a root MD.
    #[serde(default = "default_connect")]
    pub connect: String,

    /// Ingestion queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Socket settings shared by participant and upstream connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Idle read timeout. 0 disables it.
    #[serde(default)]
    pub read_timeout_ms: u64,

    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// HTTP admin endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_admin_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    std::env::var("ASTRON_BIND").unwrap_or_else(|_| "127.0.0.1:7199".to_string())
}

fn default_connect() -> String {
    std::env::var("ASTRON_UPSTREAM").unwrap_or_default()
}

fn default_queue_capacity() -> usize {
    DirectorConfig::default().queue_capacity
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_max_datagram_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_admin_bind() -> String {
    "127.0.0.1:7198".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            messagedirector: MessageDirectorConfig::default(),
            network: NetworkConfig::default(),
            metrics: MetricsConfig::default(),
            admin: AdminConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for MessageDirectorConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            connect: default_connect(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout_ms(),
            read_timeout_ms: 0,
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_admin_bind(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit path is missing, or if a config file
    /// exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        for path in &DEFAULT_CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply command line overrides.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(bind) = &args.bind {
            self.messagedirector.bind = bind.clone();
        }
        if let Some(upstream) = &args.upstream {
            self.messagedirector.connect = upstream.clone();
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    /// The address participants connect to.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured bind address is not `host:port`.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.messagedirector
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.messagedirector.bind))
    }

    /// # Errors
    ///
    /// Returns an error if the admin bind address is not `host:port`.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        self.admin
            .bind
            .parse()
            .with_context(|| format!("Invalid admin address: {}", self.admin.bind))
    }

    /// The parent MD address, if this MD is not the root.
    #[must_use]
    pub fn upstream(&self) -> Option<&str> {
        let connect = self.messagedirector.connect.trim();
        (!connect.is_empty()).then_some(connect)
    }

    #[must_use]
    pub fn director_config(&self) -> DirectorConfig {
        DirectorConfig {
            queue_capacity: self.messagedirector.queue_capacity,
        }
    }

    #[must_use]
    pub fn tcp_config(&self) -> TcpConfig {
        TcpConfig {
            write_timeout: Duration::from_millis(self.network.write_timeout_ms),
            read_timeout: (self.network.read_timeout_ms > 0)
                .then(|| Duration::from_millis(self.network.read_timeout_ms)),
            max_datagram_size: self.network.max_datagram_size,
        }
    }
}
