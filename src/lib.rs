//! hublink: device-to-cloud messaging client
//!
//! Runs one AMQP transport per configured device on top of the
//! `hublink_amqp` link layer, with shared connections, readiness tracking and
//! configurable logging.
//!
//! ## Modules
//!
//! * `config`: TOML configuration (logger, transport, devices), validated with
//!   the `validator` crate.
//!
//! * `core`: Runtime components:
//!   - `DeviceFleet`, one `LinkOrchestrator` per device over a shared registry
//!   - Readiness derived from the event-sending link state
//!
//! * `logger`: `tracing` subscriber setup. Console output in compact, pretty or
//!   JSON format and optional systemd journald output.
//!
//! ## Features
//!
//! * `journald`: systemd journald output via `tracing-journald` (default: enabled).
//!
//! The protocol engine is supplied by the application through
//! `hublink_amqp::engine::ProtocolEngine`.

pub mod config;
pub mod core;
pub mod logger;

pub use hublink_amqp as amqp;
