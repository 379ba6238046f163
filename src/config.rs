//! Command-line client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ILMP_CONFIG or --config)
//! 3. Environment variables
//! 4. Command-line flags

use ilmp_client::{ConnectionConfig, DEFAULT_PING_INTERVAL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command-line client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server to connect to.
    pub server: ServerConfig,
    /// Liveness settings.
    pub keepalive: KeepaliveConfig,
}

impl Config {
    /// Loads the given file, then applies environment variable overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    /// Unparseable values are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("ILMP_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("ILMP_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(site_dir) = lookup("ILMP_SITE_DIR") {
            self.server.site_dir = site_dir;
        }
        if let Some(secs) = lookup("ILMP_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.server.connect_timeout_secs = secs;
        }
        if let Some(secs) = lookup("ILMP_PING_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.keepalive.ping_interval_secs = secs;
        }
    }

    /// Builds the connection configuration.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.server.host.clone())
            .with_port(self.server.port)
            .with_site_dir(self.server.site_dir.clone())
            .with_connect_timeout(Duration::from_secs(self.server.connect_timeout_secs))
            .with_read_buffer_size(self.server.read_buffer_size)
            .with_ping_interval(self.keepalive.ping_interval())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Site directory; empty means the host name.
    pub site_dir: String,
    /// Per-endpoint connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Socket read buffer size in bytes.
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: ilmp_protocol::DEFAULT_PORT,
            site_dir: String::new(),
            connect_timeout_secs: 10,
            read_buffer_size: 8 * 1024,
        }
    }
}

/// Keepalive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Seconds between pings. A pong must arrive before the next one.
    pub ping_interval_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: DEFAULT_PING_INTERVAL.as_secs(),
        }
    }
}

impl KeepaliveConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.server.port, 80);
        assert_eq!(config.keepalive.ping_interval(), Duration::from_secs(60));

        let conn = config.connection_config();
        assert_eq!(conn.effective_site_dir(), "localhost");
        assert_eq!(conn.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "server:\n  host: chat.example.com\n  site_dir: rooms\n\
                    keepalive:\n  ping_interval_secs: 15\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.host, "chat.example.com");
        assert_eq!(config.server.port, 80);
        assert_eq!(config.keepalive.ping_interval_secs, 15);
        assert_eq!(config.connection_config().effective_site_dir(), "rooms");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ILMP_HOST", "10.0.0.1"),
            ("ILMP_PORT", "8080"),
            ("ILMP_PING_INTERVAL_SECS", "not a number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.host, "10.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.keepalive.ping_interval_secs, 60);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/ilmp.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
        assert!(err.to_string().contains("/nonexistent/ilmp.yaml"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.host, config.server.host);
        assert_eq!(parsed.keepalive.ping_interval_secs, 60);
    }
}
