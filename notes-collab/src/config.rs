//! Server configuration.
//!
//! Defaults, overridden by environment variables through [`ServerConfig::from_env`].
//! The binary layers its command line flags on top.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Request queue capacity of the hub worker
    pub hub_capacity: usize,
    /// Ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Disconnect after this many seconds without an inbound frame
    pub idle_timeout_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Check catalog access before admitting a connection
    pub enforce_access: bool,
    /// Relay cursor updates back to their sender too
    pub echo_cursor_to_sender: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            outbound_capacity: 256,
            hub_capacity: 1024,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            storage_path: None,
            enforce_access: true,
            echo_cursor_to_sender: true,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `NOTES_*` / `PORT` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            let port: u16 = parse("PORT", &port)?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = lookup("NOTES_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("NOTES_STORAGE_PATH") {
            config.storage_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(v) = lookup("NOTES_OUTBOUND_CAPACITY") {
            config.outbound_capacity = parse("NOTES_OUTBOUND_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("NOTES_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse("NOTES_HEARTBEAT_SECS", &v)?;
        }
        if let Some(v) = lookup("NOTES_IDLE_TIMEOUT_SECS") {
            config.idle_timeout_secs = parse("NOTES_IDLE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("NOTES_ENFORCE_ACCESS") {
            config.enforce_access = parse_bool("NOTES_ENFORCE_ACCESS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.is_empty() {
            return Err(ConfigError::Invalid("bind address is empty".into()));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid("outbound capacity must be positive".into()));
        }
        if self.hub_capacity == 0 {
            return Err(ConfigError::Invalid("hub capacity must be positive".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat interval must be positive".into()));
        }
        if self.idle_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "idle timeout ({}s) must exceed heartbeat interval ({}s)",
                self.idle_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert!(config.storage_path.is_none());
        assert!(config.enforce_access);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_environment_is_default() {
        assert_eq!(from_vars(&[]).unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_port_and_bind_addr() {
        let config = from_vars(&[("PORT", "9000")]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");

        // Explicit bind address wins over PORT
        let config = from_vars(&[("PORT", "9000"), ("NOTES_BIND_ADDR", "10.0.0.1:7000")]).unwrap();
        assert_eq!(config.bind_addr, "10.0.0.1:7000");
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("NOTES_STORAGE_PATH", "/var/lib/notes"),
            ("NOTES_OUTBOUND_CAPACITY", "8"),
            ("NOTES_HEARTBEAT_SECS", "5"),
            ("NOTES_IDLE_TIMEOUT_SECS", "20"),
            ("NOTES_ENFORCE_ACCESS", "off"),
        ])
        .unwrap();
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/notes")));
        assert_eq!(config.outbound_capacity, 8);
        assert_eq!(config.idle_timeout(), Duration::from_secs(20));
        assert!(!config.enforce_access);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            from_vars(&[("PORT", "http")]),
            Err(ConfigError::InvalidValue { key: "PORT", .. })
        ));
        assert!(from_vars(&[("NOTES_ENFORCE_ACCESS", "maybe")]).is_err());
        assert!(matches!(
            from_vars(&[("NOTES_OUTBOUND_CAPACITY", "0")]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_idle_timeout_must_exceed_heartbeat() {
        let config = ServerConfig {
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 30,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
