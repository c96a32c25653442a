//! Configuration file parsing and structures.
//!
//! gwradio uses TOML for declarative configuration. Each integration owns a
//! statically typed section under `[integrations]`; the entries listed there
//! are the persisted configuration records the integration loads at startup.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::integrations::xiaomi_gateway_radio::GatewayRadioConfig;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP API; disabled when the section is absent
    #[serde(default)]
    pub api: Option<ApiConfig>,

    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"gwradio::integrations" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the subscriber filter for this logging configuration
    pub fn targets(&self) -> Targets {
        self.overrides.iter().fold(
            Targets::new().with_default(LevelFilter::from(self.level)),
            |targets, (target, level)| targets.with_target(target.clone(), LevelFilter::from(*level)),
        )
    }
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8565
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Integration configuration container
#[derive(Debug, Default, Deserialize)]
pub struct IntegrationsConfig {
    /// Xiaomi gateway FM radio
    #[serde(default)]
    pub xiaomi_gateway_radio: Option<GatewayRadioConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        contents.parse()
    }

    /// Check constraints serde cannot express
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(radio) = &self.integrations.xiaomi_gateway_radio {
            let mut seen: HashMap<&str, &str> = HashMap::new();
            let mut ids: Vec<&String> = radio.entries.keys().collect();
            ids.sort();
            for entry_id in ids {
                let host = radio.entries[entry_id].host.as_str();
                if let Some(first) = seen.insert(host, entry_id.as_str()) {
                    return Err(ConfigError::DuplicateHost {
                        host: host.to_string(),
                        first: first.to_string(),
                        second: entry_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Host {host} is configured by both entry '{first}' and entry '{second}'")]
    DuplicateHost {
        host: String,
        first: String,
        second: String,
    },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.api.is_none());
        assert!(config.integrations.xiaomi_gateway_radio.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "debug"

            [logging.overrides]
            "gwradio::api" = "warn"

            [api]
            port = 9000

            [integrations.xiaomi_gateway_radio]
            scan_interval_secs = 30

            [integrations.xiaomi_gateway_radio.entries.kitchen]
            host = "192.168.1.20"
            token = "0123456789abcdef0123456789abcdef"
            name = "Kitchen Radio"
            volume_step = 10

            [integrations.xiaomi_gateway_radio.entries.bedroom]
            host = "192.168.1.21"
            token = "fedcba9876543210fedcba9876543210"
        "#;

        let config: Config = toml.parse().unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.logging.overrides.get("gwradio::api"),
            Some(&LogLevel::Warn)
        );

        let api = config.api.unwrap();
        assert_eq!(api.listen, "127.0.0.1");
        assert_eq!(api.port, 9000);

        let radio = config.integrations.xiaomi_gateway_radio.unwrap();
        assert_eq!(radio.scan_interval(), Duration::from_secs(30));
        assert_eq!(radio.entries.len(), 2);

        let kitchen = &radio.entries["kitchen"];
        assert_eq!(kitchen.name, "Kitchen Radio");
        assert_eq!(kitchen.volume_step, 10);

        let bedroom = &radio.entries["bedroom"];
        assert_eq!(bedroom.name, "Xiaomi Gateway Radio");
        assert_eq!(bedroom.volume_step, 5);
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let toml = r#"
            [integrations.xiaomi_gateway_radio.entries.a]
            host = "192.168.1.20"
            token = "0123456789abcdef0123456789abcdef"

            [integrations.xiaomi_gateway_radio.entries.b]
            host = "192.168.1.20"
            token = "fedcba9876543210fedcba9876543210"
        "#;

        let err = toml.parse::<Config>().unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"Host 192.168.1.20 is configured by both entry 'a' and entry 'b'"
        );
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let toml = r#"
            [logging]
            level = "loud"
        "#;

        assert!(matches!(
            toml.parse::<Config>(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gwradio.toml");
        std::fs::write(
            &path,
            r#"
            [logging]
            level = "warning"
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.logging.level, LogLevel::Warn);

        let missing = Config::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(..))));
    }
}
