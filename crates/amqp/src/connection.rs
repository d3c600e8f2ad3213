//! Session and link creation for one device.
//!
//! A `ConnectionManager` owns the connection → session chain of a single device.
//! The connection comes from the shared `ConnectionRegistry`; the session is
//! private to the device and kept in a `FaultTolerantResource`, so a session
//! that ends underneath the device is replaced on next use.
//!
//! # Deadlines
//!
//! Link creation receives one time budget for the whole chain. Whatever the
//! connection and session steps consume is subtracted before the link handshake
//! starts:
//!
//! ```text
//! budget T ──┬── connection + authorize + session open (d) ──┬── link open (≤ T - d)
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    config::Config,
    deadline::{bounded, Deadline},
    engine::{EndpointState, LinkSettings, ReceiverLink, SenderLink, Session},
    error::TransportError,
    registry::{ConnectionHandle, ConnectionKey, ConnectionRegistry},
    resource::FaultTolerantResource,
    state::ResourceState,
    transport::DeviceIdentity,
};

/// Owns the session of one device and creates links on it.
pub struct ConnectionManager {
    identity: DeviceIdentity,
    config: Config,
    key: ConnectionKey,
    registry: Arc<ConnectionRegistry>,
    session: FaultTolerantResource<Arc<dyn Session>>,

    /// Serializes session creation and repair for this device.
    session_gate: Mutex<()>,
    released: AtomicBool,
}

impl ConnectionManager {
    /// Registers the device with the registry and prepares an empty session slot.
    ///
    /// No I/O happens until the first session or link is requested.
    pub fn new(identity: DeviceIdentity, config: Config, registry: Arc<ConnectionRegistry>) -> Self {
        let key = ConnectionKey::for_device(&identity, &config);
        let handle = registry.acquire(&key, &identity.device_id);
        let session = session_resource(&identity, &config, handle);
        Self {
            identity,
            config,
            key,
            registry,
            session,
            session_gate: Mutex::new(()),
            released: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn session_state(&self) -> ResourceState {
        self.session.state()
    }

    pub fn subscribe_session_state(&self) -> watch::Receiver<ResourceState> {
        self.session.subscribe_state()
    }

    /// Returns an open session, creating or repairing it first when necessary.
    ///
    /// A session that turns out to be terminal is removed and created again,
    /// once. A second terminal session fails the call.
    pub async fn get_session(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let deadline = Deadline::after(timeout);
        let _gate = self.lock_gate(timeout, cancel).await?;
        self.ensure_not_released()?;

        let session = self
            .session
            .get_or_create(deadline.remaining_for("open session")?, cancel)
            .await?;
        self.ensure_not_released()?;
        let state = session.state();
        if state.is_open() {
            return Ok(session);
        }
        if !state.is_terminal() {
            return Err(unusable_session(state));
        }

        debug!(
            "Session of device '{}' is {:?}, recreating once",
            self.identity.device_id, state
        );
        self.session.try_remove();
        let session = self
            .session
            .get_or_create(deadline.remaining_for("open session")?, cancel)
            .await?;
        self.ensure_not_released()?;
        let state = session.state();
        if state.is_open() {
            return Ok(session);
        }

        self.session.try_remove();
        warn!(
            "Recreated session of device '{}' is {:?} again, giving up",
            self.identity.device_id, state
        );
        Err(unusable_session(state))
    }

    /// Creates and opens a sender link on the device session.
    ///
    /// `path` is the resource path, the address is built by the transport variant.
    /// The link handshake only gets what is left of `timeout` after the session
    /// was obtained.
    pub async fn create_sending_link(
        &self,
        path: &str,
        settings: LinkSettings,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn SenderLink>, TransportError> {
        let deadline = Deadline::after(timeout);
        let session = self.get_session(timeout, cancel).await?;

        let settings = LinkSettings {
            address: self.config.transport.link_address(&self.identity, path),
            ..settings
        };
        let link = session
            .create_sender(settings)
            .map_err(|e| TransportError::from_engine("create sending link", e))?;

        let opened = match deadline.remaining_for("open sending link") {
            Ok(remaining) => bounded("open sending link", remaining, cancel, link.open(remaining)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            if let Err(close_err) = link.close(self.config.close_timeout()).await {
                debug!("Closing failed sending link '{}': {}", link.name(), close_err);
            }
            return Err(e);
        }

        info!("Sending link '{}' opened on {}", link.name(), path);
        Ok(link)
    }

    /// Creates and opens a receiver link with a credit window of `prefetch`.
    pub async fn create_receiving_link(
        &self,
        path: &str,
        settings: LinkSettings,
        timeout: Duration,
        prefetch: u32,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ReceiverLink>, TransportError> {
        let deadline = Deadline::after(timeout);
        let session = self.get_session(timeout, cancel).await?;

        let settings = LinkSettings {
            address: self.config.transport.link_address(&self.identity, path),
            prefetch: Some(prefetch),
            ..settings
        };
        let link = session
            .create_receiver(settings)
            .map_err(|e| TransportError::from_engine("create receiving link", e))?;

        let opened = match deadline.remaining_for("open receiving link") {
            Ok(remaining) => {
                bounded("open receiving link", remaining, cancel, link.open(remaining)).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            if let Err(close_err) = link.close(self.config.close_timeout()).await {
                debug!("Closing failed receiving link '{}': {}", link.name(), close_err);
            }
            return Err(e);
        }

        info!("Receiving link '{}' opened on {}", link.name(), path);
        Ok(link)
    }

    /// Ends the device session and returns the connection to the registry.
    ///
    /// Idempotent. Waits for a session creation holding the gate to finish, so
    /// the session it produced is the one ended here.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _gate = self.session_gate.lock().await;
            self.session.close().await;
        }
        self.registry
            .release(&self.key, &self.identity.device_id)
            .await;
        debug!("Device '{}' released its connection", self.identity.device_id);
    }

    fn ensure_not_released(&self) -> Result<(), TransportError> {
        if self.released.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn lock_gate(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, ()>, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            guard = tokio::time::timeout(timeout, self.session_gate.lock()) => {
                guard.map_err(|_| TransportError::Timeout {
                    operation: "open session",
                    after: timeout,
                })
            }
        }
    }
}

fn unusable_session(state: EndpointState) -> TransportError {
    TransportError::Network {
        operation: "open session",
        message: format!("session is {state:?}"),
    }
}

/// Session slot: connect (shared), authorize the device, then begin and open a session.
fn session_resource(
    identity: &DeviceIdentity,
    config: &Config,
    handle: Arc<ConnectionHandle>,
) -> FaultTolerantResource<Arc<dyn Session>> {
    let audience = config.transport.audience(identity);
    let credential = identity.credential.clone();
    let close_timeout = config.close_timeout();

    FaultTolerantResource::new(
        "session",
        move |timeout, cancel: CancellationToken| {
            let handle = handle.clone();
            let audience = audience.clone();
            let credential = credential.clone();
            async move {
                let deadline = Deadline::after(timeout);
                let connection = handle.connection(timeout, &cancel).await?;

                let remaining = deadline.remaining_for("authorize")?;
                bounded(
                    "authorize",
                    remaining,
                    &cancel,
                    connection.authorize(&audience, &credential, remaining),
                )
                .await?;

                let session = connection
                    .create_session()
                    .map_err(|e| TransportError::from_engine("create session", e))?;
                let opened = match deadline.remaining_for("open session") {
                    Ok(remaining) => {
                        bounded("open session", remaining, &cancel, session.open(remaining)).await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = opened {
                    if let Err(end_err) = session.end(close_timeout).await {
                        debug!("Ending half-open session: {}", end_err);
                    }
                    return Err(e);
                }
                Ok(session)
            }
        },
        move |session: Arc<dyn Session>| async move {
            if let Err(e) = session.end(close_timeout).await {
                warn!("Failed to end session cleanly: {}", e);
            }
        },
        |session: &Arc<dyn Session>| !session.state().is_terminal(),
    )
}
