//! Unified error handling for the AMQP transport layer.
//!
//! This module defines `TransportError`, the single error type returned by every
//! public operation of the transport. Failures reported by the protocol engine
//! (`EngineError`) and by the broker (settlement outcomes) are translated into it at
//! the point of failure, so callers never see engine-specific error types.
//!
//! # Error Categories
//!
//! Every variant belongs to exactly one `ErrorKind`:
//!
//! **Transient network** (a layer above may retry):
//! - `Network`: connection, session or link creation/IO failed
//! - `Timeout`: an operation exceeded its time budget
//! - `Throttled`: broker asked the client to slow down
//!
//! **Rejected by broker**:
//! - `Rejected`, `Released`, `Unauthorized`, `MessageTooLarge`
//!
//! **Lock lost**:
//! - `LockLost`: settlement for an already-expired lock; re-receive the message
//!
//! **Usage errors** (detected before any I/O):
//! - `InvalidLockToken`, `Usage`, `Closed`, `Cancelled`, `InvalidConfig`
//!
//! **Fatal**:
//! - `Fatal`, `Protocol`
//!
//! # Cloning
//!
//! `TransportError` is `Clone`: when several callers wait for the same resource
//! creation, all of them receive the same failure.
//!
//! # Usage
//!
//! ```ignore
//! match orchestrator.settle_message(&token, Disposition::Accepted).await {
//!     Ok(()) => {}
//!     Err(e) if e.kind() == ErrorKind::LockLost => {
//!         // receive the message again, retrying settlement cannot succeed
//!     }
//!     Err(e) if e.is_transient() => { /* retry later */ }
//!     Err(e) => return Err(e),
//! }
//! ```

use std::{fmt, time::Duration};

use thiserror::Error;

use super::engine::{EngineError, EngineErrorKind, ErrorCondition};

/// Broker error condition reported when the referenced entity does not exist.
pub const NOT_FOUND: &str = "amqp:not-found";
/// Broker error condition reported for rejected credentials or claims.
pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
/// Broker error condition reported when a quota or rate limit is hit.
pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
/// Broker error condition reported for oversized messages.
pub const MESSAGE_SIZE_EXCEEDED: &str = "amqp:link:message-size-exceeded";

/// Client-facing error category.
///
/// Callers choose their remediation from the kind rather than from individual
/// variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection, session or link trouble. Retrying later is reasonable.
    TransientNetwork,
    /// The broker refused the request.
    RejectedByBroker,
    /// The message lock expired before settlement. Receive the message again.
    LockLost,
    /// The caller used the API incorrectly. Retrying the same call fails again.
    Usage,
    /// Unrecoverable condition, abort the in-flight operation.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::RejectedByBroker => "rejected-by-broker",
            ErrorKind::LockLost => "lock-lost",
            ErrorKind::Usage => "usage-error",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Structured reason attached to a rejected outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rejection {
    /// Symbolic error condition, e.g. `amqp:not-found`.
    pub condition: Option<String>,

    /// Free-form description provided by the broker.
    pub description: Option<String>,
}

impl Rejection {
    pub fn is_not_found(&self) -> bool {
        self.condition.as_deref() == Some(NOT_FOUND)
    }
}

impl From<Option<ErrorCondition>> for Rejection {
    fn from(condition: Option<ErrorCondition>) -> Self {
        match condition {
            Some(c) => Rejection {
                condition: Some(c.condition),
                description: c.description,
            },
            None => Rejection::default(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.condition, &self.description) {
            (Some(c), Some(d)) => write!(f, "{c}: {d}"),
            (Some(c), None) => write!(f, "{c}"),
            (None, Some(d)) => write!(f, "{d}"),
            (None, None) => write!(f, "no reason given"),
        }
    }
}

/// The unified error type for transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Creating or using a connection, session or link failed at the network level.
    ///
    /// Possible causes:
    /// - Socket or TLS handshake failure inside the protocol engine
    /// - Session or link detached by the broker
    /// - Engine reported an IO error while sending or receiving
    ///
    /// Recovery: the resource slot has already been cleared, so the next call
    /// recreates the resource. Retry policy belongs to the caller.
    #[error("Network error during {operation}: {message}")]
    Network {
        operation: &'static str,
        message: String,
    },

    /// An operation did not finish within its time budget.
    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The broker throttled the request (`amqp:resource-limit-exceeded`).
    #[error("Throttled by broker: {0}")]
    Throttled(Rejection),

    /// The broker rejected a delivery or settlement.
    #[error("Rejected by broker: {0}")]
    Rejected(Rejection),

    /// The broker released a sent message instead of accepting it.
    #[error("Message released by broker")]
    Released,

    /// The broker refused the device credentials or claims.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The message exceeds the maximum size the broker accepts.
    #[error("Message too large: {0}")]
    MessageTooLarge(Rejection),

    /// Settlement was rejected because the lock already expired on the broker.
    ///
    /// The message will be redelivered; settlement cannot be retried with the same
    /// lock token.
    #[error("Message lock lost: {0}")]
    LockLost(String),

    /// A lock token could not be decoded into a delivery tag.
    #[error("Invalid lock token: {0}")]
    InvalidLockToken(String),

    /// The API was used incorrectly (disabled feature, missing argument, etc.).
    #[error("Usage error: {0}")]
    Usage(String),

    /// The orchestrator was already closed.
    #[error("Transport handler is closed")]
    Closed,

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration failed validation.
    #[error("Configuration error: {0}")]
    InvalidConfig(#[from] validator::ValidationErrors),

    /// The broker or engine violated the protocol contract.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unrecoverable condition reported by the engine or runtime.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Translates an engine failure observed during `operation`.
    pub fn from_engine(operation: &'static str, err: EngineError) -> Self {
        match err.kind {
            EngineErrorKind::Io | EngineErrorKind::Detached => TransportError::Network {
                operation,
                message: err.message,
            },
            EngineErrorKind::Timeout => TransportError::Network {
                operation,
                message: format!("engine timeout: {}", err.message),
            },
            EngineErrorKind::Unauthorized => TransportError::Unauthorized(err.message),
            EngineErrorKind::Protocol => TransportError::Protocol(err.message),
            EngineErrorKind::Fatal => TransportError::Fatal(err.message),
        }
    }

    /// Maps a rejected send outcome to a client error.
    ///
    /// `amqp:not-found` stays a generic rejection here; it only means "lock lost"
    /// for settlement (see `from_settlement_rejection`).
    pub fn from_rejection(rejection: Rejection) -> Self {
        match rejection.condition.as_deref() {
            Some(UNAUTHORIZED_ACCESS) => {
                TransportError::Unauthorized(rejection.description.unwrap_or_default())
            }
            Some(RESOURCE_LIMIT_EXCEEDED) => TransportError::Throttled(rejection),
            Some(MESSAGE_SIZE_EXCEEDED) => TransportError::MessageTooLarge(rejection),
            _ => TransportError::Rejected(rejection),
        }
    }

    /// Maps a rejected settlement outcome to a client error.
    pub fn from_settlement_rejection(rejection: Rejection) -> Self {
        if rejection.is_not_found() {
            TransportError::LockLost(
                rejection
                    .description
                    .unwrap_or_else(|| "lock expired on the broker".to_string()),
            )
        } else {
            Self::from_rejection(rejection)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Network { .. }
            | TransportError::Timeout { .. }
            | TransportError::Throttled(_) => ErrorKind::TransientNetwork,
            TransportError::Rejected(_)
            | TransportError::Released
            | TransportError::Unauthorized(_)
            | TransportError::MessageTooLarge(_) => ErrorKind::RejectedByBroker,
            TransportError::LockLost(_) => ErrorKind::LockLost,
            TransportError::InvalidLockToken(_)
            | TransportError::Usage(_)
            | TransportError::Closed
            | TransportError::Cancelled
            | TransportError::InvalidConfig(_) => ErrorKind::Usage,
            TransportError::Protocol(_) | TransportError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }

    pub fn is_usage(&self) -> bool {
        self.kind() == ErrorKind::Usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejection(condition: &str) -> Rejection {
        Rejection {
            condition: Some(condition.to_string()),
            description: Some("details".to_string()),
        }
    }

    #[test]
    fn test_engine_errors_are_translated() {
        let io = EngineError::new(EngineErrorKind::Io, "connection reset");
        let err = TransportError::from_engine("open session", io);
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "Network error during open session: connection reset"
        );

        let fatal = EngineError::new(EngineErrorKind::Fatal, "out of memory");
        let err = TransportError::from_engine("send", fatal);
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(matches!(err, TransportError::Fatal(msg) if msg == "out of memory"));

        let denied = EngineError::new(EngineErrorKind::Unauthorized, "bad token");
        let err = TransportError::from_engine("authorize", denied);
        assert_eq!(err.kind(), ErrorKind::RejectedByBroker);
    }

    #[test]
    fn test_not_found_on_send_is_generic_rejection() {
        let err = TransportError::from_rejection(rejection(NOT_FOUND));
        assert!(matches!(err, TransportError::Rejected(_)));
        assert_eq!(err.kind(), ErrorKind::RejectedByBroker);
    }

    #[test]
    fn test_not_found_on_settlement_is_lock_lost() {
        let err = TransportError::from_settlement_rejection(rejection(NOT_FOUND));
        assert!(matches!(err, TransportError::LockLost(ref d) if d == "details"));
        assert_eq!(err.kind(), ErrorKind::LockLost);

        let err = TransportError::from_settlement_rejection(Rejection {
            condition: Some(NOT_FOUND.to_string()),
            description: None,
        });
        assert_eq!(err.to_string(), "Message lock lost: lock expired on the broker");
    }

    #[test]
    fn test_known_conditions_are_classified() {
        assert!(matches!(
            TransportError::from_rejection(rejection(RESOURCE_LIMIT_EXCEEDED)),
            TransportError::Throttled(_)
        ));
        assert!(TransportError::from_rejection(rejection(RESOURCE_LIMIT_EXCEEDED)).is_transient());
        assert!(matches!(
            TransportError::from_rejection(rejection(MESSAGE_SIZE_EXCEEDED)),
            TransportError::MessageTooLarge(_)
        ));
        assert!(matches!(
            TransportError::from_settlement_rejection(rejection(UNAUTHORIZED_ACCESS)),
            TransportError::Unauthorized(_)
        ));
    }

    #[test]
    fn test_usage_errors() {
        assert!(TransportError::InvalidLockToken("x".into()).is_usage());
        assert!(TransportError::Closed.is_usage());
        assert!(!TransportError::Released.is_usage());
    }

    #[test]
    fn test_rejection_display() {
        assert_eq!(rejection("amqp:x").to_string(), "amqp:x: details");
        assert_eq!(Rejection::default().to_string(), "no reason given");
    }
}
