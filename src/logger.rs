//! Logging initialization.
//!
//! `LoggerManager` validates a `LoggerConfig` and installs the global `tracing`
//! subscriber with a console layer, a journald layer, or both. Filtering follows
//! `RUST_LOG` when it is set and the configured directives otherwise.

use std::io;

use thiserror::Error;
use tracing::instrument;
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter, Layer, Registry};
use validator::{Validate, ValidationErrors};

use crate::config::logger::{ConsoleConfig, LogFormat, LoggerConfig};
#[cfg(feature = "journald")]
use crate::{print_info, print_warn};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to install the global subscriber: {0}")]
    InitializationError(String),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    /// Journald was requested but could not be reached while console output is
    /// also enabled; reported instead of silently dropping one of the outputs.
    #[error(
        "Failed to initialize journald logger, and console logger is enabled. Please check your configuration."
    )]
    JournaldFailedWithConsoleEnabled,

    #[error("Journald output requested but this build has no journald support")]
    JournaldUnsupported,
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if `config` fails validation.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    /// Installs the global subscriber. Call once, before the first transport is
    /// created.
    #[instrument(skip(self))]
    pub fn init(&self) -> Result<(), LoggerError> {
        let layers = self.build_layers()?;
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    /// Builds every enabled output layer without installing them.
    pub fn build_layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();

        if let Some(console_config) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(self.console_layer(console_config, self.filter()));
        }

        if let Some(journald_config) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match self.journald_layer(&journald_config.identifier) {
                Ok(layer) => layers.push(layer),
                Err(e) => {
                    if self.console_enabled() {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                    return Err(e);
                }
            }
        }

        if layers.is_empty() {
            return Err(LoggerError::NoLayersConfigured);
        }
        Ok(layers)
    }

    fn console_enabled(&self) -> bool {
        self.config.console.as_ref().is_some_and(|c| c.enabled)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.config.directives()))
    }

    fn console_layer(&self, config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        match config.format {
            LogFormat::Json => base.json().with_filter(filter).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        }
    }

    #[cfg(feature = "journald")]
    fn journald_layer(&self, identifier: &str) -> Result<BoxedLayer, LoggerError> {
        match tracing_journald::layer() {
            Ok(layer) => {
                print_info!(
                    "Systemd journald logger initialized with identifier: {}",
                    identifier
                );
                Ok(layer
                    .with_syslog_identifier(identifier.to_string())
                    .with_filter(self.filter())
                    .boxed())
            }
            Err(e) => {
                print_warn!("Failed to initialize systemd journald logger: {}", e);
                Err(LoggerError::IoError(e))
            }
        }
    }

    #[cfg(not(feature = "journald"))]
    fn journald_layer(&self, _identifier: &str) -> Result<BoxedLayer, LoggerError> {
        Err(LoggerError::JournaldUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::logger::JournaldConfig;

    fn console_only(format: LogFormat) -> LoggerConfig {
        LoggerConfig {
            console: Some(ConsoleConfig {
                format,
                ..Default::default()
            }),
            journald: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = LoggerConfig {
            level: "chatty".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_console_layer_for_every_format() {
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let manager = LoggerManager::new(console_only(format)).unwrap();
            assert_eq!(manager.build_layers().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_no_layers_configured() {
        let config = LoggerConfig {
            console: Some(ConsoleConfig {
                enabled: false,
                ..Default::default()
            }),
            journald: Some(JournaldConfig::default()),
            ..Default::default()
        };
        let manager = LoggerManager::new(config).unwrap();
        assert!(matches!(
            manager.build_layers(),
            Err(LoggerError::NoLayersConfigured)
        ));
    }

    #[cfg(not(feature = "journald"))]
    #[test]
    fn test_journald_requested_without_support() {
        let config = LoggerConfig {
            console: None,
            journald: Some(JournaldConfig {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let manager = LoggerManager::new(config).unwrap();
        assert!(matches!(
            manager.build_layers(),
            Err(LoggerError::JournaldUnsupported)
        ));
    }
}
