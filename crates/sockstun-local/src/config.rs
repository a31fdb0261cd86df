//! Local agent configuration
//!
//! Loaded from a JSON file:
//!
//! ```json
//! {
//!   "server": "203.0.113.10",
//!   "server_port": 8388,
//!   "server_ipv6": false,
//!   "local_address": "127.0.0.1",
//!   "local_port": 1080,
//!   "password": "secret",
//!   "timeout": 6
//! }
//! ```

use crate::server::LocalOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
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
pub struct LocalConfig {
    /// Remote agent IP address
    pub server: String,
    pub server_port: u16,
    pub server_ipv6: bool,
    pub local_address: String,
    pub local_port: u16,
    pub password: String,
    /// Tunnel setup timeout in seconds
    pub timeout: f64,
    #[serde(default = "default_send_threads")]
    pub send_threads: usize,
}

fn default_send_threads() -> usize {
    DEFAULT_SEND_THREADS
}

impl LocalConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: LocalConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote_addr()?;
        self.listen_addr()?;
        if !self.timeout.is_finite() || self.timeout <= 0.0 || self.timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "timeout must be a positive number of seconds up to {}, got {}",
                MAX_TIMEOUT_SECS, self.timeout
            )));
        }
        if self.send_threads == 0 {
            return Err(ConfigError::Invalid("send_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Address of the remote agent
    pub fn remote_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .server
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("server is not an IP address: {:?}", self.server)))?;
        if ip.is_ipv6() != self.server_ipv6 {
            return Err(ConfigError::Invalid(format!(
                "server {} does not match server_ipv6 = {}",
                ip, self.server_ipv6
            )));
        }
        Ok(SocketAddr::new(ip, self.server_port))
    }

    /// Address the SOCKS5 listener binds to
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.local_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "local_address is not an IP address: {:?}",
                self.local_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.local_port))
    }

    pub fn options(&self) -> Result<LocalOptions, ConfigError> {
        self.validate()?;
        Ok(LocalOptions {
            listen_addr: self.listen_addr()?,
            remote_addr: self.remote_addr()?,
            password: self.password.clone(),
            timeout: Duration::from_secs_f64(self.timeout),
            send_threads: self.send_threads,
        })
    }
}
