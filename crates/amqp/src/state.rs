//! Lifecycle state of fault-tolerant resources.
//!
//! Every `FaultTolerantResource` (connection, session, each logical link) tracks
//! its own state and publishes it on a watch channel, so application code can
//! observe link health without polling the protocol engine.
//!
//! # Examples
//!
//! ```ignore
//! let mut rx = orchestrator.subscribe_link_state(LinkKind::EventSend);
//! while rx.changed().await.is_ok() {
//!     println!("event link: {}", *rx.borrow());
//! }
//! ```

use std::fmt;

/// Lifecycle of one resource slot.
///
/// - `Unopened` -> `Opening` -> `Open` (creation succeeded)
/// - `Opening` -> `Unopened` (creation failed or was cancelled)
/// - `Open` -> `Unopened` (fault observed, next use recreates)
/// - any -> `Closing` -> `Closed` (explicit close)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Nothing created yet, or the previous instance faulted.
    Unopened,

    /// A creation attempt is in flight.
    Opening,

    /// An instance is held and believed healthy.
    Open,

    /// The held instance is being closed.
    Closing,

    /// Explicitly closed.
    Closed,
}

impl ResourceState {
    /// Returns a short, allocation-free identifier for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Unopened => "Unopened",
            ResourceState::Opening => "Opening",
            ResourceState::Open => "Open",
            ResourceState::Closing => "Closing",
            ResourceState::Closed => "Closed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ResourceState::Open)
    }

    /// True while the resource is closing or closed.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, ResourceState::Closing | ResourceState::Closed)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
