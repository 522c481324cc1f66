//! Gateway Configuration
//!
//! Loaded from an optional TOML file. Every section and field has a default,
//! so an empty file (or no file) yields a working gateway.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! tcp_ports = [9000]
//! udp_ports = [9001]
//! http_port = 9002
//!
//! [pool]
//! workers = 4
//!
//! [plugins]
//! directory = "./plugins"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub plugins: PluginConfig,
}

impl GatewayConfig {
    /// Load from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Network listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
    /// `None` disables the HTTP listener
    pub http_port: Option<u16>,
    pub http_route: String,
    /// Largest accepted message; longer frames get an error response
    pub max_message_bytes: usize,
    pub http_response_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            tcp_ports: vec![9000],
            udp_ports: vec![9001],
            http_port: Some(9002),
            http_route: "/iots".to_string(),
            max_message_bytes: 64 * 1024,
            http_response_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn http_response_timeout(&self) -> Duration {
        Duration::from_secs(self.http_response_timeout_secs)
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            name: "gateway".to_string(),
        }
    }
}

/// Plugin directory and process timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub directory: PathBuf,
    /// Archive file extension, without the dot
    pub extension: String,
    pub watch: bool,
    pub ready_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./plugins"),
            extension: "plugin".to_string(),
            watch: true,
            ready_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl PluginConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
