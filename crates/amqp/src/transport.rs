//! Transport variants and device identity.
//!
//! A device reaches the broker either directly over TCP/TLS or tunneled through a
//! WebSocket. The variant is chosen once from configuration; everything that
//! differs between the two (ports, handshake settings, addressing) is answered by
//! `TransportKind` instead of being dispatched at runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default port for AMQP over TLS.
pub const AMQPS_PORT: u16 = 5671;
/// Default port for AMQP tunneled over secure WebSockets.
pub const WEBSOCKET_PORT: u16 = 443;
/// WebSocket path exposed by the hub.
pub const WEBSOCKET_PATH: &str = "/$iothub/websocket";
/// WebSocket sub-protocol for AMQP.
pub const WEBSOCKET_SUBPROTOCOL: &str = "AMQPWSB10";

/// How the connection reaches the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct TCP socket with TLS.
    #[default]
    Tcp,

    /// AMQP frames tunneled inside a secure WebSocket.
    #[serde(alias = "ws")]
    WebSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::WebSocket => "websocket",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Tcp => AMQPS_PORT,
            TransportKind::WebSocket => WEBSOCKET_PORT,
        }
    }

    /// Builds the handshake settings handed to the protocol engine.
    pub fn settings(&self, host: &str, port: u16) -> TransportSettings {
        match self {
            TransportKind::Tcp => TransportSettings {
                kind: *self,
                scheme: "amqps",
                host: host.to_string(),
                port,
                path: None,
                subprotocol: None,
            },
            TransportKind::WebSocket => TransportSettings {
                kind: *self,
                scheme: "wss",
                host: host.to_string(),
                port,
                path: Some(WEBSOCKET_PATH),
                subprotocol: Some(WEBSOCKET_SUBPROTOCOL),
            },
        }
    }

    /// Builds a link address from the hub endpoint and a resource path.
    ///
    /// Link addresses always use the AMQP endpoint form, whatever carries the
    /// frames underneath.
    pub fn link_address(&self, identity: &DeviceIdentity, path: &str) -> String {
        format!("amqps://{}:{}{}", identity.host_name, AMQPS_PORT, path)
    }

    /// Builds the authorization audience for one device.
    pub fn audience(&self, identity: &DeviceIdentity) -> String {
        format!(
            "{}/devices/{}",
            identity.host_name,
            urlencoding::encode(&identity.device_id)
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub kind: TransportKind,
    pub scheme: &'static str,
    pub host: String,
    pub port: u16,
    pub path: Option<&'static str>,
    pub subprotocol: Option<&'static str>,
}

impl TransportSettings {
    pub fn uri(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme,
            self.host,
            self.port,
            self.path.unwrap_or("")
        )
    }
}

/// Opaque credential material (shared access signature, token, ...).
///
/// The transport only forwards it to the engine; it never parses or logs it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Identity and endpoint of one logical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Hub host name, e.g. `myhub.azure-devices.net`.
    pub host_name: String,
    pub device_id: String,
    pub credential: Credential,
}

impl DeviceIdentity {
    pub fn new(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            credential,
        }
    }

    /// Device id as it appears inside resource paths.
    pub fn encoded_device_id(&self) -> String {
        urlencoding::encode(&self.device_id).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("hub.example.net", "dev 1/a", Credential::new("secret"))
    }

    #[test]
    fn test_settings_per_variant() {
        let tcp = TransportKind::Tcp.settings("hub.example.net", 5671);
        assert_eq!(tcp.uri(), "amqps://hub.example.net:5671");
        assert!(tcp.subprotocol.is_none());

        let ws = TransportKind::WebSocket.settings("hub.example.net", 443);
        assert_eq!(ws.uri(), "wss://hub.example.net:443/$iothub/websocket");
        assert_eq!(ws.subprotocol, Some("AMQPWSB10"));
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(TransportKind::Tcp.default_port(), 5671);
        assert_eq!(TransportKind::WebSocket.default_port(), 443);
    }

    #[test]
    fn test_audience_encodes_device_id() {
        let audience = TransportKind::Tcp.audience(&identity());
        assert_eq!(audience, "hub.example.net/devices/dev%201%2Fa");
    }

    #[test]
    fn test_link_address() {
        let address = TransportKind::WebSocket.link_address(&identity(), "/devices/x/messages/events");
        assert_eq!(address, "amqps://hub.example.net:5671/devices/x/messages/events");
    }

    #[test]
    fn test_credential_is_redacted() {
        let debug = format!("{:?}", identity());
        assert!(!debug.contains("secret"));
        assert!(debug.contains("Credential(***)"));
    }
}
