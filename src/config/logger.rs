//! Logging configuration.
//!
//! These types describe how the `tracing` subscriber is assembled: a global
//! level, an optional separate level for the client core, and the console
//! and journald outputs. Validation runs through `validator`.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Target of every event emitted by the client core.
pub const CLIENT_TARGET: &str = "skylark_client";

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global log level: trace, debug, info, warn or error (case-insensitive).
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Level for the client core only. Protocol state transitions are logged
    /// at debug, individual messages at trace.
    #[validate(custom(function = "validate_log_level"))]
    pub client_level: Option<String>,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

impl LoggerConfig {
    /// Filter directives used when `RUST_LOG` is not set.
    pub fn directives(&self) -> String {
        let level = self.level.to_lowercase();
        match &self.client_level {
            Some(client) => format!("{level},{CLIENT_TARGET}={}", client.to_lowercase()),
            None => level,
        }
    }

    /// True when at least one output is switched on.
    pub fn has_output(&self) -> bool {
        self.console.as_ref().is_some_and(|c| c.enabled)
            || self.journald.as_ref().is_some_and(|j| j.enabled)
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            client_level: None,
            console: Some(ConsoleConfig::default()),
            journald: Some(JournaldConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,

    pub format: LogFormat,

    /// Include the log target (module path) in output.
    pub show_target: bool,

    pub show_thread_ids: bool,

    /// Include span close events in output.
    pub show_spans: bool,

    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: true,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journald output (Unix only).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    pub enabled: bool,

    /// Syslog identifier for journal entries. Must be non-empty.
    #[validate(length(min = 1))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "skylark".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LoggerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.has_output());
        assert_eq!(config.directives(), "info");
    }

    #[test]
    fn test_client_level_adds_directive() {
        let config = LoggerConfig {
            level: "WARN".into(),
            client_level: Some("Trace".into()),
            ..Default::default()
        };
        assert_eq!(config.directives(), "warn,skylark_client=trace");
    }

    #[test]
    fn test_invalid_levels_are_rejected() {
        let config = LoggerConfig {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LoggerConfig {
            client_level: Some("verbose".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_journald_identifier_is_rejected() {
        let config = LoggerConfig {
            journald: Some(JournaldConfig {
                enabled: true,
                identifier: String::new(),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_output_when_everything_disabled() {
        let config = LoggerConfig {
            console: None,
            journald: Some(JournaldConfig::default()),
            ..Default::default()
        };
        assert!(!config.has_output());
    }

    #[test]
    fn test_format_names_are_lowercase() {
        let console: ConsoleConfig = toml::from_str("format = \"pretty\"").unwrap();
        assert_eq!(console.format, LogFormat::Pretty);
    }
}
