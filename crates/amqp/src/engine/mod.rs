//! Protocol engine abstraction.
//!
//! The transport does not encode frames itself. It drives an external protocol
//! engine through the traits below: a `ProtocolEngine` opens `Connection`s, a
//! connection hosts `Session`s, and sessions attach `SenderLink`s and
//! `ReceiverLink`s.
//!
//! ```text
//! LinkOrchestrator
//!     ↓
//! ConnectionManager (session + links, one device)
//!     ↓
//! ConnectionRegistry (shared connections)
//!     ↓
//! ProtocolEngine → Connection → Session → Sender/Receiver links
//!     ↓
//! Network (TCP/TLS or WebSocket)
//! ```
//!
//! State inspection (`state()`, `is_closed()`) must be cheap and non-blocking:
//! the transport calls it on every fast-path reuse check.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub use crate::wire::{Delivery, DeliveryTag, ErrorCondition, Outcome, WireMessage};
use crate::transport::{Credential, TransportSettings};

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

/// Category of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Socket, TLS or framing IO failure.
    Io,
    /// The engine gave up waiting for a peer response.
    Timeout,
    /// The session or link was detached or ended by the peer.
    Detached,
    /// The peer refused authorization.
    Unauthorized,
    /// The peer violated the protocol.
    Protocol,
    /// Unrecoverable engine condition.
    Fatal,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineErrorKind::Io => "io",
            EngineErrorKind::Timeout => "timeout",
            EngineErrorKind::Detached => "detached",
            EngineErrorKind::Unauthorized => "unauthorized",
            EngineErrorKind::Protocol => "protocol",
            EngineErrorKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Error reported by the protocol engine.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Last known state of a session or link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl EndpointState {
    pub fn is_open(&self) -> bool {
        matches!(self, EndpointState::Opened)
    }

    /// Closed and faulted endpoints can never be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EndpointState::Closed | EndpointState::Faulted)
    }
}

/// Direction of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Sender => f.write_str("sender"),
            LinkRole::Receiver => f.write_str("receiver"),
        }
    }
}

/// Sender settlement mode negotiated on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    Mixed,
}

/// Receiver settlement mode negotiated on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// Receiver settles first; the sender does not wait for a second round-trip.
    First,
    /// Receiver settles only after the sender settled.
    Second,
}

/// Attach parameters for a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    /// Link name, unique per open attempt.
    pub name: String,
    pub role: LinkRole,

    /// Target address for senders, source address for receivers.
    pub address: String,

    /// Credit window for receivers.
    pub prefetch: Option<u32>,
    pub sender_settle_mode: SenderSettleMode,
    pub receiver_settle_mode: ReceiverSettleMode,

    /// Link attach properties.
    pub properties: BTreeMap<String, String>,
}

impl LinkSettings {
    pub fn sender(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: LinkRole::Sender,
            address: String::new(),
            prefetch: None,
            sender_settle_mode: SenderSettleMode::Unsettled,
            receiver_settle_mode: ReceiverSettleMode::First,
            properties: BTreeMap::new(),
        }
    }

    pub fn receiver(name: impl Into<String>) -> Self {
        Self {
            role: LinkRole::Receiver,
            ..Self::sender(name)
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_settle_modes(mut self, sender: SenderSettleMode, receiver: ReceiverSettleMode) -> Self {
        self.sender_settle_mode = sender;
        self.receiver_settle_mode = receiver;
        self
    }
}

/// Callback invoked by the engine for every delivery on a receiver link with a
/// registered listener.
pub type DeliveryListener = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Entry point of the protocol engine.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Opens a transport-level connection (socket, security, protocol handshake).
    async fn connect(
        &self,
        settings: &TransportSettings,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>, EngineError>;
}

/// An open connection, possibly shared by several devices.
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Authorizes one device for `audience` on this connection.
    async fn authorize(
        &self,
        audience: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    /// Constructs a session; it is not usable before `Session::open` completes.
    fn create_session(&self) -> Result<Arc<dyn Session>, EngineError>;

    async fn close(&self, timeout: Duration) -> Result<(), EngineError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    fn state(&self) -> EndpointState;

    async fn open(&self, timeout: Duration) -> Result<(), EngineError>;

    /// Constructs a sender link attached to this session (not yet opened).
    fn create_sender(&self, settings: LinkSettings) -> Result<Arc<dyn SenderLink>, EngineError>;

    /// Constructs a receiver link attached to this session (not yet opened).
    fn create_receiver(
        &self,
        settings: LinkSettings,
    ) -> Result<Arc<dyn ReceiverLink>, EngineError>;

    async fn end(&self, timeout: Duration) -> Result<(), EngineError>;
}

#[async_trait]
pub trait SenderLink: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> EndpointState;

    async fn open(&self, timeout: Duration) -> Result<(), EngineError>;

    /// Sends one message and waits for the broker's outcome.
    async fn send(
        &self,
        message: WireMessage,
        tag: DeliveryTag,
        timeout: Duration,
    ) -> Result<Outcome, EngineError>;

    async fn close(&self, timeout: Duration) -> Result<(), EngineError>;
}

#[async_trait]
pub trait ReceiverLink: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> EndpointState;

    async fn open(&self, timeout: Duration) -> Result<(), EngineError>;

    /// Waits up to `timeout` for the next delivery. `Ok(None)` when nothing arrived.
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, EngineError>;

    /// Requests settlement of a delivery and returns the broker's outcome.
    async fn settle(
        &self,
        tag: &DeliveryTag,
        outcome: Outcome,
        timeout: Duration,
    ) -> Result<Outcome, EngineError>;

    /// Switches the link to push mode: every delivery is handed to `listener`.
    fn register_listener(&self, listener: DeliveryListener);

    /// Settles a delivery without waiting for the broker.
    fn dispose(&self, tag: &DeliveryTag, outcome: Outcome);

    async fn close(&self, timeout: Duration) -> Result<(), EngineError>;
}
