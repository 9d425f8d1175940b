//! Application configuration loading and validation.
//!
//! The top-level `Config` aggregates the logger settings and the client
//! options. It is loaded once from a TOML file early in startup and treated
//! as immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use skylark_client::ClientOptions;
use validator::Validate;

use super::config::logger::LoggerConfig;

pub mod logger;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "SKYLARK_CONFIG";

/// Location used when `SKYLARK_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/skylark/config.toml";

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Current UTC time with microsecond precision, for the early print macros.
#[doc(hidden)]
pub fn early_timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

/// Errors raised while locating, reading, parsing or validating the
/// configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
///
/// ```toml
/// [logger]
/// level = "debug"
///
/// [client]
/// id = "sensor_17"
/// service = ["amqps://broker-a:5671", "amqps://broker-b:5671"]
/// user = "sensor"
/// password = "secret"
///
/// [client.retry]
/// initial_delay_ms = 500
/// ```
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Options handed to `skylark_client::Client::new`.
    pub client: ClientOptions,
}

impl Config {
    /// Locates and loads the configuration file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be found, read, parsed or
    /// validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Priority:
    /// 1. `SKYLARK_CONFIG` environment variable
    /// 2. `/etc/skylark/config.toml`
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    /// Loads and validates configuration from `path`.
    ///
    /// Client options go through [`ClientOptions::validated`], so the returned
    /// configuration always carries a client id.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(path.to_string_lossy().to_string()));
        }

        let config_str = fs::read_to_string(path)?;
        let mut config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        config.client = config
            .client
            .validated()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }
}
