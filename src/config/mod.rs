//! Application configuration loading and validation.
//!
//! The top-level `Config` aggregates logging, the AMQP transport settings and the
//! list of devices this process connects. It is loaded once from TOML at startup
//! and stays immutable afterwards.
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [transport]
//! transport = "websocket"
//! open_timeout = 30
//!
//! [[devices]]
//! host_name = "myhub.azure-devices.net"
//! device_id = "sensor-1"
//! shared_access_signature = "SharedAccessSignature sr=..."
//! ```

use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
};

use hublink_amqp::{Credential, DeviceIdentity};
use serde::{Deserialize, Serialize};
use validator::Validate;

use self::logger::LoggerConfig;

pub mod logger;

/// Environment variable that overrides the configuration file location.
pub const CONFIG_ENV: &str = "HUBLINK_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/hublink/config.toml";

/// Writes one timestamped line to stdout. Backs the `print_*` macros, which are
/// used while the tracing subscriber is not installed yet.
#[doc(hidden)]
pub fn print_line(level: console::StyledObject<&str>, args: fmt::Arguments<'_>) {
    let timestamp = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    println!("{}  {} {}", console::style(timestamp).dim(), level, args);
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("INFO").green(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("WARN").yellow(), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        $crate::config::print_line(console::style("ERROR").red(), format_args!($($arg)*))
    };
}

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
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Settings shared by every device transport.
    #[validate(nested)]
    pub transport: hublink_amqp::Config,

    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,
}

/// One device connected by this process.
#[derive(Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct DeviceConfig {
    #[validate(length(min = 1, message = "Host name must not be empty"))]
    pub host_name: String,

    #[validate(length(min = 1, max = 128, message = "Device id must be 1 to 128 characters"))]
    pub device_id: String,

    #[validate(length(min = 1, message = "Shared access signature must not be empty"))]
    pub shared_access_signature: String,
}

impl DeviceConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            self.host_name.clone(),
            self.device_id.clone(),
            Credential::new(self.shared_access_signature.clone()),
        )
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("shared_access_signature", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Locates the configuration file and loads it.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Priority:
    /// 1. `HUBLINK_CONFIG` environment variable
    /// 2. `/etc/hublink/config.toml`
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
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(path.to_string_lossy().to_string()));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!(
            "Successfully loaded config from: {} ({} device(s))",
            path.display(),
            config.devices.len()
        );
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    pub fn parse(config_str: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        config.check_unique_devices()?;

        Ok(config)
    }

    fn check_unique_devices(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert((device.host_name.as_str(), device.device_id.as_str())) {
                return Err(ConfigError::ValidationError(format!(
                    "device '{}' on '{}' is configured more than once",
                    device.device_id, device.host_name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use hublink_amqp::TransportKind;

    use super::*;

    const SAMPLE: &str = r#"
[logger]
level = "debug"

[transport]
transport = "websocket"
open_timeout = 30
prefetch_count = 10

[[devices]]
host_name = "hub.example.net"
device_id = "sensor-1"
shared_access_signature = "SharedAccessSignature sr=abc"

[[devices]]
host_name = "hub.example.net"
device_id = "sensor 2"
shared_access_signature = "SharedAccessSignature sr=def"
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.transport.transport, TransportKind::WebSocket);
        assert_eq!(config.transport.open_timeout, 30);
        assert_eq!(config.transport.prefetch_count, 10);
        assert_eq!(config.transport.port(), 443);
        assert_eq!(config.devices.len(), 2);

        let identity = config.devices[1].identity();
        assert_eq!(identity.device_id, "sensor 2");
        assert_eq!(identity.encoded_device_id(), "sensor%202");
        assert_eq!(identity.credential.expose(), "SharedAccessSignature sr=def");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Config(_))));
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::parse("").unwrap();
        assert!(config.devices.is_empty());
        assert_eq!(config.transport, hublink_amqp::Config::default());
    }

    #[test]
    fn test_parse_error() {
        let result = Config::parse("[transport\nport = 1");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_nested_transport_validation() {
        let result = Config::parse("[transport]\nprefetch_count = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_empty_device_id_is_rejected() {
        let toml = r#"
[[devices]]
host_name = "hub.example.net"
device_id = ""
shared_access_signature = "sig"
"#;
        assert!(matches!(
            Config::parse(toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_duplicate_devices_are_rejected() {
        let toml = r#"
[[devices]]
host_name = "hub.example.net"
device_id = "sensor-1"
shared_access_signature = "a"

[[devices]]
host_name = "hub.example.net"
device_id = "sensor-1"
shared_access_signature = "b"
"#;
        let err = Config::parse(toml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_debug_redacts_signature() {
        let device = DeviceConfig {
            host_name: "hub.example.net".to_string(),
            device_id: "sensor-1".to_string(),
            shared_access_signature: "top-secret".to_string(),
        };
        let rendered = format!("{:?}", device);
        assert!(!rendered.contains("top-secret"));
        assert!(rendered.contains("sensor-1"));
    }
}
