//! Lock tokens: the client-facing form of delivery tags.
//!
//! A received message is identified towards the caller by a lock token, the
//! canonical string form of a 128-bit identifier. Settlement turns the token back
//! into the exact 16 delivery-tag bytes observed at receive time.
//!
//! Tokens use the mixed-endian GUID byte layout, so the strings match what other
//! hub clients print for the same delivery.

use std::{fmt, str::FromStr};

use uuid::Uuid;

use super::{error::TransportError, wire::DeliveryTag};

/// Size of a delivery tag that can be represented as a lock token.
pub const DELIVERY_TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Derives the lock token of a delivery.
    ///
    /// Fails with a protocol error when the broker sent a tag that is not 16 bytes.
    pub fn from_delivery_tag(tag: &DeliveryTag) -> Result<Self, TransportError> {
        let bytes: [u8; DELIVERY_TAG_LEN] = tag.as_bytes().try_into().map_err(|_| {
            TransportError::Protocol(format!(
                "delivery tag has {} bytes, expected {DELIVERY_TAG_LEN}",
                tag.len()
            ))
        })?;
        Ok(Self(Uuid::from_bytes_le(bytes)))
    }

    pub fn to_delivery_tag(&self) -> DeliveryTag {
        DeliveryTag::new(self.0.to_bytes_le().to_vec())
    }

    /// Parses a caller-supplied token.
    pub fn parse(token: &str) -> Result<Self, TransportError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TransportError::InvalidLockToken(
                "lock token must not be empty".to_string(),
            ));
        }
        Uuid::parse_str(token)
            .map(Self)
            .map_err(|e| TransportError::InvalidLockToken(format!("'{token}': {e}")))
    }
}

impl FromStr for LockToken {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Decodes a lock token string into the delivery tag used at receive time.
pub fn convert_to_delivery_tag(lock_token: &str) -> Result<DeliveryTag, TransportError> {
    LockToken::parse(lock_token).map(|token| token.to_delivery_tag())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_tag_bytes() {
        for _ in 0..64 {
            let tag = DeliveryTag::random();
            let token = LockToken::from_delivery_tag(&tag).unwrap().to_string();
            let decoded = convert_to_delivery_tag(&token).unwrap();
            assert_eq!(decoded, tag);
        }
    }

    #[test]
    fn test_guid_byte_layout() {
        let tag = DeliveryTag::new((0u8..16).collect::<Vec<_>>());
        let token = LockToken::from_delivery_tag(&tag).unwrap();
        assert_eq!(token.to_string(), "03020100-0504-0706-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn test_uppercase_and_braced_tokens_parse() {
        let tag = DeliveryTag::random();
        let token = LockToken::from_delivery_tag(&tag).unwrap();
        let upper = token.to_string().to_uppercase();
        assert_eq!(convert_to_delivery_tag(&upper).unwrap(), tag);
        assert_eq!(
            convert_to_delivery_tag(&format!("{{{}}}", token)).unwrap(),
            tag
        );
    }

    #[test]
    fn test_malformed_tokens_are_usage_errors() {
        for token in ["", "   ", "not-a-token", "0302010005040706080"] {
            let err = convert_to_delivery_tag(token).unwrap_err();
            assert!(matches!(err, TransportError::InvalidLockToken(_)), "{token}");
            assert!(err.is_usage());
        }
    }

    #[test]
    fn test_short_delivery_tag_is_protocol_error() {
        let err = LockToken::from_delivery_tag(&DeliveryTag::new(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
