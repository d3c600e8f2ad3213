//! Logging configuration.
//!
//! Settings for the console and journald outputs installed by
//! `LoggerManager`. Every struct deserializes from the `[logger]` table and is
//! checked with `validator` before the subscriber is built.
//!
//! ```toml
//! [logger]
//! level = "info"
//! transport_level = "debug"
//!
//! [logger.console]
//! enabled = true
//! format = "json"
//!
//! [logger.journald]
//! enabled = false
//! identifier = "hublink"
//! ```

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global level: trace, debug, info, warn or error (case-insensitive).
    /// `RUST_LOG`, when set, takes precedence.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Level for the AMQP link layer only, e.g. `debug` to follow link lifecycle
    /// without raising the global level.
    #[validate(custom(function = "validate_log_level"))]
    pub transport_level: Option<String>,

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
    /// Filter directives handed to `EnvFilter` when `RUST_LOG` is not set.
    pub fn directives(&self) -> String {
        match &self.transport_level {
            Some(transport) => format!(
                "{},hublink_amqp={}",
                self.level.to_lowercase(),
                transport.to_lowercase()
            ),
            None => self.level.to_lowercase(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            transport_level: None,
            console: Some(ConsoleConfig::default()),
            journald: Some(JournaldConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,

    pub format: LogFormat,

    /// Include the log target (module path), useful to tell link layer and
    /// application apart.
    pub show_target: bool,

    pub show_thread_ids: bool,

    /// Log span close events with their duration.
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

/// systemd journald output (Linux only).
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct JournaldConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Syslog identifier of the journal entries.
    #[validate(length(min = 1, message = "Journald identifier must not be empty"))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "hublink".to_string(),
        }
    }
}
