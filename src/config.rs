//! Launch configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `FASTCS_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use fastcs::config::LaunchConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LaunchConfig::load_from("config/demo.toml")?;
//! config.validate()?;
//! println!("Serving {} on {}", config.application.name, config.controller.address());
//! # Ok(())
//! # }
//! ```
//!
//! `FASTCS_CONTROLLER__PORT=25566` overrides `[controller] port`.

use fastcs_core::{BackendConfig, IpConnectionSettings};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FASTCS_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Rejected configuration values.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid log_level '{0}'. Must be one of: trace, debug, info, warn, error")]
    LogLevel(String),

    #[error("Invalid port {0}")]
    Port(u16),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level launch configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub application: ApplicationConfig,
    pub backend: BackendSettings,
    pub controller: ControllerSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "fastcs".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Console log layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// How long shutdown waits for background tasks before aborting them
    pub shutdown_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Where the demo temperature controller lives and how many ramps it has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub ip: String,
    pub port: u16,
    pub num_ramp_controllers: usize,
    /// Per-query reply deadline; 0 waits indefinitely
    pub response_timeout_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 25565,
            num_ramp_controllers: 4,
            response_timeout_ms: 1000,
        }
    }
}

impl ControllerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn ip_settings(&self) -> IpConnectionSettings {
        let mut settings = IpConnectionSettings::new(self.ip.clone(), self.port);
        settings.response_timeout = match self.response_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        settings
    }
}

fn default_shutdown_timeout() -> u64 {
    BackendConfig::default().shutdown_timeout.as_millis() as u64
}

impl LaunchConfig {
    /// Defaults merged with `FASTCS_` environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        Self::figment().extract().map_err(|e| Box::new(e).into())
    }

    /// Load from a TOML file, then apply environment overrides.
    ///
    /// A missing file is not an error; defaults fill every absent key.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Figment::from(Serialized::defaults(LaunchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Box::new(e).into())
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(LaunchConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::LogLevel(self.application.log_level.clone()));
        }

        if self.application.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "application.name",
                reason: "must not be empty".to_string(),
            });
        }

        if self.controller.port == 0 {
            return Err(ConfigError::Port(self.controller.port));
        }

        if self.controller.ip.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "controller.ip",
                reason: "must not be empty".to_string(),
            });
        }

        if self.controller.num_ramp_controllers == 0 {
            return Err(ConfigError::Invalid {
                field: "controller.num_ramp_controllers",
                reason: "at least one ramp controller is required".to_string(),
            });
        }

        // Ramp suffixes are two digits on the wire
        if self.controller.num_ramp_controllers > 99 {
            return Err(ConfigError::Invalid {
                field: "controller.num_ramp_controllers",
                reason: format!("{} exceeds 99", self.controller.num_ramp_controllers),
            });
        }

        if self.backend.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "backend.shutdown_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            shutdown_timeout: Duration::from_millis(self.backend.shutdown_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = LaunchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend_config().shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.controller.address(), "127.0.0.1:25565");
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [application]
            name = "bench"
            log_level = "debug"
            log_format = "json"

            [backend]
            shutdown_timeout_ms = 250

            [controller]
            ip = "10.0.0.7"
            port = 4000
            num_ramp_controllers = 2
            response_timeout_ms = 0
            "#,
        );

        let config = LaunchConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.backend_config().shutdown_timeout, Duration::from_millis(250));
        assert_eq!(config.controller.num_ramp_controllers, 2);

        let ip = config.controller.ip_settings();
        assert_eq!(ip.address(), "10.0.0.7:4000");
        assert_eq!(ip.response_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config("[controller]\nport = 30000\n");
        let config = LaunchConfig::load_from(file.path()).unwrap();
        assert_eq!(config.controller.port, 30000);
        assert_eq!(config.controller.num_ramp_controllers, 4);
        assert_eq!(config.application.log_level, "info");
        assert_eq!(
            config.controller.ip_settings().response_timeout,
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_wrong_type_is_load_error() {
        let file = write_config("[controller]\nport = \"not a port\"\n");
        let err = LaunchConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = LaunchConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::LogLevel(_))));

        config.application.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_controller_settings() {
        let mut config = LaunchConfig::default();
        config.controller.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Port(0))));

        let mut config = LaunchConfig::default();
        config.controller.num_ramp_controllers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "controller.num_ramp_controllers",
                ..
            })
        ));

        let mut config = LaunchConfig::default();
        config.controller.num_ramp_controllers = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected_at_load() {
        let file = write_config("[application]\nlog_format = \"xml\"\n");
        assert!(LaunchConfig::load_from(file.path()).is_err());
    }
}
