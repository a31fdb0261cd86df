//! Remote agent configuration
//!
//! Loaded from a JSON file:
//!
//! ```json
//! {
//!   "server_port": 8388,
//!   "server_ipv6": false,
//!   "password": "secret",
//!   "dns_timeout": 3,
//!   "timeout": 5
//! }
//! ```

use crate::server::RemoteOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Longest accepted timeout, in seconds (one day)
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// Default number of compression threads
pub const DEFAULT_SEND_THREADS: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Port the tunnel listener binds to on every interface
    pub server_port: u16,
    /// Listen on `::` instead of `0.0.0.0`
    pub server_ipv6: bool,
    /// Password every REQUEST must carry
    pub password: String,
    /// Name resolution timeout in seconds
    pub dns_timeout: f64,
    /// Destination connect timeout in seconds
    pub timeout: f64,
    #[serde(default = "default_send_threads")]
    pub send_threads: usize,
}

fn default_send_threads() -> usize {
    DEFAULT_SEND_THREADS
}

fn seconds(key: &str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 || value > MAX_TIMEOUT_SECS {
        return Err(ConfigError::Invalid(format!(
            "{} must be a positive number of seconds up to {}, got {}",
            key, MAX_TIMEOUT_SECS, value
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

impl RemoteConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RemoteConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        seconds("dns_timeout", self.dns_timeout)?;
        seconds("timeout", self.timeout)?;
        if self.send_threads == 0 {
            return Err(ConfigError::Invalid("send_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        let ip = if self.server_ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, self.server_port)
    }

    pub fn options(&self) -> Result<RemoteOptions, ConfigError> {
        self.validate()?;
        Ok(RemoteOptions {
            listen_addr: self.listen_addr(),
            password: self.password.clone(),
            dns_timeout: seconds("dns_timeout", self.dns_timeout)?,
            timeout: seconds("timeout", self.timeout)?,
            send_threads: self.send_threads,
        })
    }
}
