/// Configuration management for pasarela

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main pasarela configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Backend cluster configuration
    pub proxy: ProxyConfig,
    /// ARP cache invalidation configuration
    #[serde(default)]
    pub arp: ArpConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the proxy accepts client connections on
    pub listen_addr: String,
    /// Plain TCP liveness port for the proxy itself
    pub health_port: Option<u16>,
}

/// Backend cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Health probe timeout in milliseconds; the monitor ticks every timeout / 5
    pub healthcheck_timeout_ms: u64,
    /// Backend connect timeout in milliseconds
    pub dial_timeout_ms: u64,
    /// Rule used to pick the active backend among healthy ones
    pub active_selection: ActiveSelection,
    /// Cluster members
    pub backends: Vec<BackendConfig>,
}

/// One cluster member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status_port: u16,
    pub status_endpoint: String,
}

/// Tie-break policy over the ordinal index reported by healthy backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveSelection {
    LowestIndex,
    HighestIndex,
}

/// ARP cache invalidation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArpConfig {
    pub enabled: bool,
    /// Clear the ARP entry every N consecutive failed probes
    pub clear_threshold: u64,
    /// Path to the arp binary
    pub binary: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            clear_threshold: 5,
            binary: "/usr/sbin/arp".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:3306".to_string(),
                health_port: None,
            },
            proxy: ProxyConfig {
                healthcheck_timeout_ms: 5000,
                dial_timeout_ms: 5000,
                active_selection: ActiveSelection::LowestIndex,
                backends: vec![BackendConfig {
                    name: "node-0".to_string(),
                    host: "127.0.0.1".to_string(),
                    port: 13306,
                    status_port: 9200,
                    status_endpoint: "api/v1/status".to_string(),
                }],
            },
            arp: ArpConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl ProxyConfig {
    pub fn healthcheck_timeout(&self) -> Duration {
        Duration::from_millis(self.healthcheck_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid listen_addr: {}",
                    self.server.listen_addr
                ))
            })?;

        if self.server.health_port == Some(0) {
            return Err(ConfigError::ValidationError(
                "health_port must be greater than 0".to_string(),
            ));
        }

        // The tick period is timeout / 5 and must not collapse to zero
        if self.proxy.healthcheck_timeout_ms < 5 {
            return Err(ConfigError::ValidationError(
                "healthcheck_timeout_ms must be at least 5".to_string(),
            ));
        }

        if self.proxy.dial_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dial_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.proxy.backends.is_empty() {
            return Err(ConfigError::ValidationError(
                "backends cannot be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for (i, backend) in self.proxy.backends.iter().enumerate() {
            backend.validate().map_err(|msg| {
                ConfigError::ValidationError(format!("proxy.backends[{}].{}", i, msg))
            })?;

            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate backend name: {}",
                    backend.name
                )));
            }
        }

        if self.arp.clear_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "arp clear_threshold must be greater than 0".to_string(),
            ));
        }

        if self.arp.enabled && self.arp.binary.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "arp binary cannot be empty when arp is enabled".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file describing a three node cluster
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let backends = (0..3)
            .map(|i| BackendConfig {
                name: format!("node-{}", i),
                host: format!("10.0.1.{}", 10 + i),
                port: 3306,
                status_port: 9200,
                status_endpoint: "api/v1/status".to_string(),
            })
            .collect();

        let defaults = Config::default();
        let config = Config {
            server: ServerConfig {
                listen_addr: "0.0.0.0:3306".to_string(),
                health_port: Some(1936),
            },
            proxy: ProxyConfig {
                backends,
                ..defaults.proxy
            },
            ..defaults
        };

        config.save_to_file(path)
    }
}

impl BackendConfig {
    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name cannot be empty".to_string());
        }
        if self.host.trim().is_empty() {
            return Err("host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be greater than 0".to_string());
        }
        if self.status_port == 0 {
            return Err("status_port must be greater than 0".to_string());
        }
        if self.status_endpoint.trim().is_empty() {
            return Err("status_endpoint cannot be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.healthcheck_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.proxy.backends.clear();
        assert!(config.validate().is_err());

        config = Config::default();
        config.proxy.healthcheck_timeout_ms = 4;
        assert!(config.validate().is_err());

        config = Config::default();
        config.server.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_validation_reports_index() {
        let mut config = Config::default();
        config.proxy.backends[0].status_port = 0;

        match config.validate() {
            Err(ConfigError::ValidationError(msg)) => {
                assert_eq!(msg, "proxy.backends[0].status_port must be greater than 0");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_backend_names_rejected() {
        let mut config = Config::default();
        let dup = config.proxy.backends[0].clone();
        config.proxy.backends.push(dup);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_active_selection_parsing() {
        let toml_str = r#"
            [server]
            listen_addr = "127.0.0.1:3306"

            [proxy]
            healthcheck_timeout_ms = 1000
            dial_timeout_ms = 500
            active_selection = "highest_index"

            [[proxy.backends]]
            name = "a"
            host = "10.0.0.1"
            port = 3306
            status_port = 9200
            status_endpoint = "api/v1/status"

            [logging]
            level = "debug"
            format = "json"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.active_selection, ActiveSelection::HighestIndex);
        assert!(!config.arp.enabled);
        assert_eq!(config.arp.clear_threshold, 5);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.proxy.backends.len(), 3);
        assert_eq!(loaded_config.server.health_port, Some(1936));
    }
}
