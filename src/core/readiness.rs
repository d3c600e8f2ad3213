//! Readiness tracking for device transports.
//!
//! A device is ready when its event-sending link is open. The link layer
//! publishes `ResourceState` on a watch channel; `Readiness` translates it into
//! a `ReadinessState` that the rest of the application can wait on.

use std::fmt;

use hublink_amqp::ResourceState;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Ready,
    /// Not ready, with the reason.
    NotReadyYet(String),
    /// Nothing observed yet.
    Unknown,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReadinessState::Ready => "Ready",
            ReadinessState::NotReadyYet(_) => "NotReadyYet",
            ReadinessState::Unknown => "Unknown",
        }
    }

    /// Reason of a `NotReadyYet` state, empty otherwise.
    pub fn reason(&self) -> &str {
        match self {
            ReadinessState::NotReadyYet(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Ready => write!(f, "Ready"),
            ReadinessState::NotReadyYet(reason) => write!(f, "NotReadyYet: {}", reason),
            ReadinessState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Maps a link lifecycle state to readiness.
pub fn adapt_link_state(state: ResourceState) -> ReadinessState {
    match state {
        ResourceState::Open => ReadinessState::Ready,
        ResourceState::Opening => ReadinessState::NotReadyYet("Opening link...".to_string()),
        ResourceState::Unopened => ReadinessState::NotReadyYet("Link not open".to_string()),
        ResourceState::Closing => ReadinessState::NotReadyYet("Closing".to_string()),
        ResourceState::Closed => ReadinessState::NotReadyYet("Closed".to_string()),
    }
}

/// Forwards link state changes to `state_tx` until either side goes away.
pub async fn listen(
    mut link_state_rx: watch::Receiver<ResourceState>,
    state_tx: watch::Sender<ReadinessState>,
) {
    let initial = *link_state_rx.borrow_and_update();
    let readiness = adapt_link_state(initial);
    debug!("Initial link state {} -> readiness {}", initial, readiness);
    if state_tx.send(readiness).is_err() {
        return;
    }

    while link_state_rx.changed().await.is_ok() {
        let link_state = *link_state_rx.borrow_and_update();
        let readiness = adapt_link_state(link_state);
        debug!("Transition: link {} -> readiness {}", link_state, readiness);

        if state_tx.send(readiness).is_err() {
            warn!("No subscribers to readiness status");
            break;
        }
    }

    debug!("Link state channel closed, listening stopped");
}

/// Shared readiness tracker; clones observe the same state.
#[derive(Debug, Clone)]
pub struct Readiness {
    state_tx: watch::Sender<ReadinessState>,
    state_rx: watch::Receiver<ReadinessState>,
}

impl Readiness {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ReadinessState::Unknown);
        Self { state_tx, state_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ReadinessState {
        self.state_rx.borrow().clone()
    }

    /// Spawns a task that follows `link_state_rx`. Must be called inside a
    /// Tokio runtime.
    pub fn start_listening(&self, link_state_rx: watch::Receiver<ResourceState>) {
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            listen(link_state_rx, state_tx).await;
        });
    }

    /// Waits until the state is `Ready`. Returns immediately if it already is.
    pub async fn wait_ready(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(ReadinessState::is_ready).await;
    }

    pub fn set_state(&self, state: ReadinessState) {
        let old_state = self.state_tx.send_replace(state.clone());
        debug!(
            "The readiness status has changed: {} -> {}",
            old_state, state
        );
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}
