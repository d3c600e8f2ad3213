//! Configuration for the AMQP transport.
//!
//! All settings support serde deserialization (TOML in practice) and are
//! validated with the `validator` crate. Durations are expressed in whole seconds
//! in configuration and exposed as `Duration` through accessor methods.
//!
//! # Examples
//!
//! ```toml
//! [transport]
//! transport = "websocket"
//! connection_pooling = true
//! open_timeout = 30
//! operation_timeout = 60
//! prefetch_count = 50
//! methods_enabled = true
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::transport::TransportKind;

/// Default API version announced on every link.
pub const DEFAULT_API_VERSION: &str = "2021-04-12";

/// Main transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct Config {
    /// How frames reach the broker.
    ///
    /// # Examples
    /// ```toml
    /// transport = "tcp"        # AMQP over TLS, port 5671
    /// transport = "websocket"  # AMQP over secure WebSocket, port 443
    /// ```
    pub transport: TransportKind,

    /// Port override. When absent, the transport variant's default port is used.
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: Option<u16>,

    /// Share one connection between all devices using the same hub and transport.
    ///
    /// When disabled, every device gets a private connection.
    pub connection_pooling: bool,

    /// Time budget (seconds) for opening a connection, session and link chain.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Open timeout must be between 1 and 300 seconds"
    ))]
    pub open_timeout: u64,

    /// Time budget (seconds) for a single send, receive or settle operation.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Operation timeout must be between 1 and 300 seconds"
    ))]
    pub operation_timeout: u64,

    /// Time budget (seconds) for best-effort teardown of one resource.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Close timeout must be between 1 and 60 seconds"
    ))]
    pub close_timeout: u64,

    /// Credit window of the command-receive link.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Prefetch count must be between 1 and 1000"
    ))]
    pub prefetch_count: u32,

    /// Whether method links may be enabled at runtime.
    pub methods_enabled: bool,

    /// API version announced in link attach properties.
    #[validate(length(min = 1, message = "API version must not be empty"))]
    pub api_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            port: None,
            connection_pooling: true,
            open_timeout: 60,
            operation_timeout: 60,
            close_timeout: 10,
            prefetch_count: 50,
            methods_enabled: true,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }
}

impl Config {
    /// Effective broker port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport.default_port())
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout)
    }
}
