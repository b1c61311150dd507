//! Server configuration.
//!
//! Layered: defaults, then a TOML file, then `POTLINE_`-prefixed environment
//! variables (`__` separates nested keys, e.g. `POTLINE_HARDWARE__BASE_URL`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "potline.toml";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration.
    #[error("Configuration error: {0}")]
    Parse(String),

    /// The specified configuration file was not found.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenSettings,

    #[serde(default)]
    pub hardware: HardwareSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

const fn default_bind_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5001)
}

/// Controller endpoint. Without a `base_url` no commands are sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSettings {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl HardwareSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

const fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageSettings {
    #[default]
    Memory,
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

const fn default_max_connections() -> u32 {
    5
}

impl ServerConfig {
    /// Load from `path`, or from `potline.toml` if it exists.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file just means defaults plus environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Self::default()));

        let figment = match path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(ConfigError::FileNotFound(path.to_owned()));
                }
                figment.merge(Toml::file(path))
            }
            None => {
                if !Path::new(DEFAULT_CONFIG_PATH).exists() {
                    tracing::info!(
                        path = DEFAULT_CONFIG_PATH,
                        "No config file found, using defaults and environment"
                    );
                }
                figment.merge(Toml::file(DEFAULT_CONFIG_PATH))
            }
        };

        let config: Self = figment
            .merge(Env::prefixed("POTLINE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(content))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hardware.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "hardware.timeout_ms must be greater than zero".into(),
            ));
        }
        if let Some(url) = &self.hardware.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "hardware.base_url must be an http(s) URL, got {url}"
                )));
            }
        }
        Ok(())
    }
}
