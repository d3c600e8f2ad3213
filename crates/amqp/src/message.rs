//! Application-level messages and their conversion to the wire envelope.
//!
//! The transport never encodes payloads itself. A `MessageConverter` maps
//! application messages to `WireMessage` envelopes and back; the default
//! converter copies properties one-to-one and keeps the body as a single data
//! section.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use super::{
    error::TransportError,
    lock_token::LockToken,
    wire::{WireBody, WireMessage, WireProperties},
};

/// Application property carrying the invoked method name.
pub const METHOD_NAME_PROPERTY: &str = "IoThub-methodname";
/// Content type set on JSON bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Application property carrying the method response status.
pub const METHOD_STATUS_PROPERTY: &str = "IoThub-status";

/// A telemetry or command message as seen by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Message with a JSON-encoded body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, TransportError> {
        let mut message = Self::new(encode_json(value)?);
        message.content_type = Some(JSON_CONTENT_TYPE.to_string());
        message.content_encoding = Some("utf-8".to_string());
        Ok(message)
    }

    /// Decodes the body as JSON.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        decode_json(&self.body)
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A received message waiting for settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message: Message,

    /// Token to pass to `settle_message`.
    pub lock_token: LockToken,
}

/// Final disposition requested by the application for a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove it from the queue.
    Accepted,
    /// Not processed; make it available for redelivery.
    Released,
    /// Cannot be processed; dead-letter it.
    Rejected,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Accepted => "accepted",
            Disposition::Released => "released",
            Disposition::Rejected => "rejected",
        }
    }
}

/// An inbound method invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub name: String,
    pub request_id: String,
    pub payload: Bytes,
}

impl MethodRequest {
    /// Decodes the request payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        decode_json(&self.payload)
    }
}

/// The application's answer to a `MethodRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResponse {
    pub request_id: String,
    pub status: i32,
    pub payload: Bytes,
}

impl MethodResponse {
    pub fn new(request: &MethodRequest, status: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status,
            payload: payload.into(),
        }
    }

    /// Response with a JSON-encoded payload.
    pub fn json<T: Serialize>(
        request: &MethodRequest,
        status: i32,
        payload: &T,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(request, status, encode_json(payload)?))
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, TransportError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| TransportError::Usage(format!("payload is not serializable as JSON: {e}")))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(bytes)
        .map_err(|e| TransportError::Usage(format!("payload is not the expected JSON: {e}")))
}

/// Converts between application messages and wire envelopes.
pub trait MessageConverter: Send + Sync {
    fn to_wire(&self, message: &Message) -> Result<WireMessage, TransportError>;

    fn from_wire(&self, wire: WireMessage) -> Result<Message, TransportError>;

    fn method_request_from_wire(&self, wire: WireMessage) -> Result<MethodRequest, TransportError>;

    fn method_response_to_wire(&self, response: &MethodResponse) -> Result<WireMessage, TransportError>;
}

/// Property-for-property conversion with a single data section body.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMessageConverter;

impl MessageConverter for DefaultMessageConverter {
    fn to_wire(&self, message: &Message) -> Result<WireMessage, TransportError> {
        Ok(WireMessage {
            properties: WireProperties {
                message_id: message.message_id.clone(),
                correlation_id: message.correlation_id.clone(),
                content_type: message.content_type.clone(),
                content_encoding: message.content_encoding.clone(),
                to: None,
            },
            application_properties: message.properties.clone(),
            body: WireBody::Data(message.body.clone()),
            message_format: None,
        })
    }

    fn from_wire(&self, wire: WireMessage) -> Result<Message, TransportError> {
        let body = match wire.body {
            WireBody::Data(bytes) => bytes,
            WireBody::Batch(_) => {
                return Err(TransportError::Protocol(
                    "batched envelope received on a device-bound link".to_string(),
                ))
            }
        };
        Ok(Message {
            message_id: wire.properties.message_id,
            correlation_id: wire.properties.correlation_id,
            content_type: wire.properties.content_type,
            content_encoding: wire.properties.content_encoding,
            properties: wire.application_properties,
            body,
        })
    }

    fn method_request_from_wire(&self, wire: WireMessage) -> Result<MethodRequest, TransportError> {
        let name = wire
            .application_property(METHOD_NAME_PROPERTY)
            .ok_or_else(|| {
                TransportError::Protocol(format!("method request without {METHOD_NAME_PROPERTY}"))
            })?
            .to_string();
        let request_id = wire.properties.correlation_id.clone().ok_or_else(|| {
            TransportError::Protocol("method request without correlation id".to_string())
        })?;
        let payload = match wire.body {
            WireBody::Data(bytes) => bytes,
            WireBody::Batch(_) => Bytes::new(),
        };
        Ok(MethodRequest {
            name,
            request_id,
            payload,
        })
    }

    fn method_response_to_wire(&self, response: &MethodResponse) -> Result<WireMessage, TransportError> {
        let mut wire = WireMessage::data(response.payload.clone());
        wire.properties.correlation_id = Some(response.request_id.clone());
        wire.application_properties
            .insert(METHOD_STATUS_PROPERTY.to_string(), response.status.to_string());
        Ok(wire)
    }
}
