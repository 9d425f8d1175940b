//! Logging initialization.
//!
//! `LoggerManager` validates a [`LoggerConfig`] and installs the global
//! `tracing` subscriber with a console layer and, where available, a systemd
//! journald layer. `RUST_LOG` takes precedence over the configured levels.

use std::io;

use thiserror::Error;
use tracing::instrument;
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter, Layer, Registry};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(String),

    /// No output layers were configured or initialized.
    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    /// Journald failed while console output is also requested; refuse to run
    /// with half the configured outputs.
    #[error("Failed to initialize journald logger while console logging is enabled")]
    JournaldFailedWithConsoleEnabled,
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    /// Builds the output layers and installs them as the global subscriber.
    /// Call once, before the client is created.
    ///
    /// # Errors
    ///
    /// Fails if no layer could be created, if journald fails while console
    /// output is enabled, or if a global subscriber already exists.
    #[instrument(skip(self))]
    pub fn init(&self) -> Result<(), LoggerError> {
        let layers = self.layers()?;
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::AlreadyInitialized(e.to_string()))
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.config.directives()))
    }

    fn layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();
        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(console_layer(console, self.filter()));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match tracing_journald::layer() {
                Ok(layer) => {
                    let layer = layer.with_syslog_identifier(journald.identifier.clone());
                    layers.push(layer.with_filter(self.filter()).boxed());
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if !layers.is_empty() {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        Ok(layers)
    }
}

fn console_layer(config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
    let spans = if config.show_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_span_events(spans)
        .with_ansi(config.ansi_colors)
        .with_writer(io::stdout);
    match config.format {
        LogFormat::Json => layer.json().with_filter(filter).boxed(),
        LogFormat::Pretty => layer.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => layer.compact().with_filter(filter).boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::logger::JournaldConfig;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = LoggerConfig {
            level: "shouting".into(),
            ..Default::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_no_enabled_output_has_no_layers() {
        let manager = LoggerManager::new(LoggerConfig {
            console: None,
            journald: Some(JournaldConfig::default()),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            manager.layers(),
            Err(LoggerError::NoLayersConfigured)
        ));
    }

    #[test]
    fn test_console_layer_for_every_format() {
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let manager = LoggerManager::new(LoggerConfig {
                console: Some(ConsoleConfig {
                    format,
                    ..Default::default()
                }),
                journald: None,
                ..Default::default()
            })
            .unwrap();
            assert_eq!(manager.layers().unwrap().len(), 1);
        }
    }
}
