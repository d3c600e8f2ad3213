//! Wire-level types exchanged with the protocol engine.
//!
//! These types describe the message envelope, delivery tags and settlement
//! outcomes at the level the protocol engine understands. Frame encoding stays
//! inside the engine; this module only carries the values across the boundary.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Message format marker telling the broker that the body is a batch of
/// individually encoded messages.
///
/// Without this marker the broker treats the carrier as one opaque message.
pub const BATCHED_MESSAGE_FORMAT: u32 = 0x8001_3700;

/// Opaque protocol-level identifier of an unsettled delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(Bytes);

impl DeliveryTag {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Builds a tag from a fresh random 128-bit value.
    pub fn random() -> Self {
        Self(Bytes::copy_from_slice(uuid::Uuid::new_v4().as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Standard message properties carried in the envelope header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub to: Option<String>,
}

/// Body of a wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireBody {
    /// Single binary data section.
    Data(Bytes),

    /// Several complete messages wrapped in one carrier.
    Batch(Vec<WireMessage>),
}

impl Default for WireBody {
    fn default() -> Self {
        WireBody::Data(Bytes::new())
    }
}

/// Message envelope handed to and received from the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub properties: WireProperties,
    pub application_properties: BTreeMap<String, String>,
    pub body: WireBody,

    /// Message format code; `None` means the default format.
    pub message_format: Option<u32>,
}

impl WireMessage {
    pub fn data(body: impl Into<Bytes>) -> Self {
        Self {
            body: WireBody::Data(body.into()),
            ..Default::default()
        }
    }

    /// Wraps several envelopes into one carrier tagged with the batch marker.
    pub fn batch(messages: Vec<WireMessage>) -> Self {
        Self {
            body: WireBody::Batch(messages),
            message_format: Some(BATCHED_MESSAGE_FORMAT),
            ..Default::default()
        }
    }

    pub fn is_batch(&self) -> bool {
        self.message_format == Some(BATCHED_MESSAGE_FORMAT)
    }

    pub fn application_property(&self, key: &str) -> Option<&str> {
        self.application_properties.get(key).map(String::as_str)
    }
}

/// Error condition attached to a rejected outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCondition {
    pub condition: String,
    pub description: Option<String>,
}

impl ErrorCondition {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Terminal settlement outcome reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected(Option<ErrorCondition>),
    Released,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Rejected(_) => "rejected",
            Outcome::Released => "released",
        }
    }
}

/// A message delivered on a receiver link and not yet settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: WireMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_sets_format_marker() {
        let carrier = WireMessage::batch(vec![WireMessage::data("a"), WireMessage::data("b")]);
        assert!(carrier.is_batch());
        assert_eq!(carrier.message_format, Some(0x8001_3700));
        match carrier.body {
            WireBody::Batch(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected body {other:?}"),
        }
        assert!(!WireMessage::data("a").is_batch());
    }

    #[test]
    fn test_random_tags_are_distinct() {
        let a = DeliveryTag::random();
        let b = DeliveryTag::random();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
