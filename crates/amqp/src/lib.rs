//! # hublink_amqp: fault-tolerant AMQP link layer for device clients
//!
//! This crate keeps a device connected to a message hub over AMQP. It sits on top
//! of a protocol engine (anything implementing the traits in `engine`) and adds:
//!
//! - **Lazy, recreate-on-fault resources**: connections, sessions and links are
//!   created on first use and replaced transparently after a fault
//! - **At most one creation at a time**: concurrent callers share one attempt
//! - **Shared connections**: devices on the same hub and transport share one
//!   reference-counted connection
//! - **Composed deadlines**: one budget covers connection, session and link
//! - **Typed outcomes**: broker dispositions become `TransportError` variants
//!   with a client-facing `ErrorKind`
//! - **Idempotent shutdown**: `close` runs once, whoever calls it
//!
//! # Quick Start
//!
//! ```ignore
//! use std::{sync::Arc, time::Duration};
//! use hublink_amqp::{
//!     Config, ConnectionRegistry, Credential, DefaultMessageConverter, DeviceIdentity,
//!     LinkOrchestrator, Message,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::default();
//! let registry = Arc::new(ConnectionRegistry::new(engine, config.close_timeout()));
//! let identity = DeviceIdentity::new("myhub.azure-devices.net", "sensor-1", Credential::new(sas));
//! let transport = LinkOrchestrator::new(identity, config, registry.clone(), Arc::new(DefaultMessageConverter))?;
//!
//! let cancel = CancellationToken::new();
//! transport.open(true, Duration::from_secs(30), &cancel).await?;
//! transport.send_event(&Message::new("{\"t\":21.5}"), Duration::from_secs(10), &cancel).await?;
//! transport.close().await;
//! registry.shutdown().await;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     LinkOrchestrator                 │
//! │ events, commands, methods            │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │     ConnectionManager (per device)   │
//! │ session slot, link creation          │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │     ConnectionRegistry (shared)      │
//! │ reference-counted connections        │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │     ProtocolEngine                   │
//! │ frames, sockets, TLS, WebSocket      │
//! └──────────────────────────────────────┘
//! ```
//!
//! Every box above the engine keeps its objects in a `FaultTolerantResource`.
//!
//! # Error Handling
//!
//! ```ignore
//! match transport.complete(&token, &cancel).await {
//!     Ok(()) => {}
//!     Err(e) if e.kind() == ErrorKind::LockLost => { /* receive again */ }
//!     Err(e) if e.is_transient() => { /* retry later */ }
//!     Err(e) => return Err(e),
//! }
//! ```
//!
//! This layer never retries; retry policy belongs to the caller.

// Module declarations
pub mod config;
pub mod connection;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod lock_token;
pub mod message;
pub mod orchestrator;
pub mod registry;
pub mod resource;
pub mod state;
pub mod transport;
pub mod wire;

// Re-exports: Configuration
pub use config::Config;
// Re-exports: Error handling
//
// Every operation returns TransportError
pub use error::{ErrorKind, Rejection, TransportError};
// Re-exports: Lifecycle building blocks
pub use connection::ConnectionManager;
pub use registry::{ConnectionHandle, ConnectionKey, ConnectionRegistry};
pub use resource::FaultTolerantResource;
pub use state::ResourceState;
// Re-exports: High-level types
//
// These are the entry points for applications
pub use lock_token::LockToken;
pub use message::{
    DefaultMessageConverter, Disposition, Message, MessageConverter, MethodRequest, MethodResponse,
    ReceivedMessage,
};
pub use orchestrator::{LinkKind, LinkOrchestrator, MethodHandler};
pub use transport::{Credential, DeviceIdentity, TransportKind};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
