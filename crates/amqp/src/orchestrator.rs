//! Logical links of one device and the operations applications call.
//!
//! The `LinkOrchestrator` multiplexes up to four links over the device session:
//!
//! | Link             | Role     | Path                                  | Created              |
//! |------------------|----------|---------------------------------------|----------------------|
//! | event send       | sender   | `/devices/{id}/messages/events`       | `open` or first send |
//! | command receive  | receiver | `/devices/{id}/messages/deviceBound`  | `open` or first receive |
//! | method send      | sender   | `/devices/{id}/methods/devicebound`   | `enable_methods`     |
//! | method receive   | receiver | `/devices/{id}/methods/devicebound`   | `enable_methods`     |
//!
//! Each link lives in its own `FaultTolerantResource`: operations take the open
//! link when there is one and otherwise create it on the spot, so a link that
//! faulted is transparently replaced on next use. Broker outcomes are translated
//! into `TransportError` here; nothing in this layer retries.
//!
//! # Lifecycle
//!
//! `close` tears everything down exactly once, however many callers invoke it,
//! and hands the connection back to the registry. An orchestrator must be closed
//! explicitly (or used through `scoped`); dropping it without closing only logs a
//! warning.
//!
//! # Examples
//!
//! ```ignore
//! let transport = Arc::new(LinkOrchestrator::new(identity, config, registry, converter)?);
//! transport.scoped(|t| async move {
//!     t.open(true, Duration::from_secs(30), &cancel).await?;
//!     t.send_event(&Message::new("21.5"), Duration::from_secs(10), &cancel).await?;
//!     if let Some(received) = t.receive(Duration::from_secs(5), &cancel).await? {
//!         t.complete(&received.lock_token.to_string(), &cancel).await?;
//!     }
//!     Ok::<_, TransportError>(())
//! }).await?;
//! ```

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::{
    config::Config,
    connection::ConnectionManager,
    deadline::{bounded, Deadline},
    engine::{
        Delivery, DeliveryListener, DeliveryTag, ErrorCondition, LinkSettings, Outcome, ReceiverLink,
        ReceiverSettleMode, SenderLink, SenderSettleMode, WireMessage,
    },
    error::{TransportError, NOT_FOUND},
    lock_token::{convert_to_delivery_tag, LockToken},
    message::{Disposition, Message, MessageConverter, MethodRequest, MethodResponse, ReceivedMessage},
    registry::ConnectionRegistry,
    resource::FaultTolerantResource,
    state::ResourceState,
    transport::DeviceIdentity,
};

/// Link attach property shared by the two method links.
pub const CHANNEL_CORRELATION_ID_PROPERTY: &str = "com.microsoft:channel-correlation-id";
/// Link attach property announcing the service API version.
pub const API_VERSION_PROPERTY: &str = "com.microsoft:api-version";

/// Broker condition used when a method request cannot be decoded.
const DECODE_ERROR: &str = "amqp:decode-error";

/// Callback receiving inbound method requests.
///
/// Called once per request on the engine's delivery path; the request is
/// accepted at link level right after the callback returns.
pub type MethodHandler = Arc<dyn Fn(MethodRequest) + Send + Sync>;

/// The logical links managed by an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    EventSend,
    CommandReceive,
    MethodSend,
    MethodReceive,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::EventSend => "events",
            LinkKind::CommandReceive => "commands",
            LinkKind::MethodSend => "methods-send",
            LinkKind::MethodReceive => "methods-receive",
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn events_path(device: &str) -> String {
    format!("/devices/{device}/messages/events")
}

fn commands_path(device: &str) -> String {
    format!("/devices/{device}/messages/deviceBound")
}

fn methods_path(device: &str) -> String {
    format!("/devices/{device}/methods/devicebound")
}

/// Link names only aid diagnostics, but each attempt gets a fresh one.
fn link_name(kind: LinkKind, device: &str) -> String {
    format!("{}_{}_{}", kind.as_str(), device, Uuid::new_v4())
}

/// Transport handler of one device.
pub struct LinkOrchestrator {
    connection: Arc<ConnectionManager>,
    converter: Arc<dyn MessageConverter>,

    event_sender: FaultTolerantResource<Arc<dyn SenderLink>>,
    command_receiver: FaultTolerantResource<Arc<dyn ReceiverLink>>,
    method_sender: FaultTolerantResource<Arc<dyn SenderLink>>,
    method_receiver: FaultTolerantResource<Arc<dyn ReceiverLink>>,

    method_handler: Arc<Mutex<Option<MethodHandler>>>,
    methods_active: AtomicBool,

    closing: AtomicBool,
    closed: OnceCell<()>,
}

impl LinkOrchestrator {
    /// Builds the orchestrator and registers the device with `registry`.
    ///
    /// No link is opened here; see `open`.
    ///
    /// # Returns
    /// - `Ok(Self)`: Orchestrator with every link slot empty
    /// - `Err(TransportError::InvalidConfig)`: If `config` fails validation
    pub fn new(
        identity: DeviceIdentity,
        config: Config,
        registry: Arc<ConnectionRegistry>,
        converter: Arc<dyn MessageConverter>,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let device = identity.encoded_device_id();
        let close_timeout = config.close_timeout();
        let prefetch = config.prefetch_count;
        let api_version = config.api_version.clone();
        let channel_correlation_id = format!("methods:{}", Uuid::new_v4());
        let method_handler: Arc<Mutex<Option<MethodHandler>>> = Arc::new(Mutex::new(None));

        let connection = Arc::new(ConnectionManager::new(identity, config, registry));

        let event_sender = {
            let manager = connection.clone();
            let path = events_path(&device);
            let device = device.clone();
            FaultTolerantResource::new(
                "event sending link",
                move |timeout, cancel: CancellationToken| {
                    let manager = manager.clone();
                    let path = path.clone();
                    let settings = LinkSettings::sender(link_name(LinkKind::EventSend, &device))
                        .with_settle_modes(SenderSettleMode::Unsettled, ReceiverSettleMode::First);
                    async move {
                        manager
                            .create_sending_link(&path, settings, timeout, &cancel)
                            .await
                    }
                },
                move |link: Arc<dyn SenderLink>| close_sender(link, close_timeout),
                |link: &Arc<dyn SenderLink>| link.state().is_open(),
            )
        };

        let command_receiver = {
            let manager = connection.clone();
            let path = commands_path(&device);
            let device = device.clone();
            FaultTolerantResource::new(
                "command receiving link",
                move |timeout, cancel: CancellationToken| {
                    let manager = manager.clone();
                    let path = path.clone();
                    let settings =
                        LinkSettings::receiver(link_name(LinkKind::CommandReceive, &device))
                            .with_settle_modes(SenderSettleMode::Unsettled, ReceiverSettleMode::Second);
                    async move {
                        manager
                            .create_receiving_link(&path, settings, timeout, prefetch, &cancel)
                            .await
                    }
                },
                move |link: Arc<dyn ReceiverLink>| close_receiver(link, close_timeout),
                |link: &Arc<dyn ReceiverLink>| link.state().is_open(),
            )
        };

        let method_sender = {
            let manager = connection.clone();
            let path = methods_path(&device);
            let device = device.clone();
            let correlation = channel_correlation_id.clone();
            let api_version = api_version.clone();
            FaultTolerantResource::new(
                "method sending link",
                move |timeout, cancel: CancellationToken| {
                    let manager = manager.clone();
                    let path = path.clone();
                    let settings = LinkSettings::sender(link_name(LinkKind::MethodSend, &device))
                        .with_settle_modes(SenderSettleMode::Settled, ReceiverSettleMode::First)
                        .with_property(CHANNEL_CORRELATION_ID_PROPERTY, correlation.as_str())
                        .with_property(API_VERSION_PROPERTY, api_version.as_str());
                    async move {
                        manager
                            .create_sending_link(&path, settings, timeout, &cancel)
                            .await
                    }
                },
                move |link: Arc<dyn SenderLink>| close_sender(link, close_timeout),
                |link: &Arc<dyn SenderLink>| link.state().is_open(),
            )
        };

        let method_receiver = {
            let manager = connection.clone();
            let path = methods_path(&device);
            let handler = method_handler.clone();
            let converter = converter.clone();
            FaultTolerantResource::new(
                "method receiving link",
                move |timeout, cancel: CancellationToken| {
                    let manager = manager.clone();
                    let path = path.clone();
                    let handler = handler
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    let converter = converter.clone();
                    let settings = LinkSettings::receiver(link_name(LinkKind::MethodReceive, &device))
                        .with_settle_modes(SenderSettleMode::Settled, ReceiverSettleMode::First)
                        .with_property(CHANNEL_CORRELATION_ID_PROPERTY, channel_correlation_id.as_str())
                        .with_property(API_VERSION_PROPERTY, api_version.as_str());
                    async move {
                        let Some(handler) = handler else {
                            return Err(TransportError::Usage(
                                "no method handler registered".to_string(),
                            ));
                        };
                        let link = manager
                            .create_receiving_link(&path, settings, timeout, prefetch, &cancel)
                            .await?;
                        link.register_listener(method_listener(
                            Arc::downgrade(&link),
                            handler,
                            converter,
                        ));
                        Ok(link)
                    }
                },
                move |link: Arc<dyn ReceiverLink>| close_receiver(link, close_timeout),
                |link: &Arc<dyn ReceiverLink>| link.state().is_open(),
            )
        };

        Ok(Self {
            connection,
            converter,
            event_sender,
            command_receiver,
            method_sender,
            method_receiver,
            method_handler,
            methods_active: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: OnceCell::new(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.connection.identity().device_id
    }

    pub fn config(&self) -> &Config {
        self.connection.config()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Current lifecycle state of one link.
    pub fn link_state(&self, kind: LinkKind) -> ResourceState {
        match kind {
            LinkKind::EventSend => self.event_sender.state(),
            LinkKind::CommandReceive => self.command_receiver.state(),
            LinkKind::MethodSend => self.method_sender.state(),
            LinkKind::MethodReceive => self.method_receiver.state(),
        }
    }

    /// Watches the lifecycle state of one link.
    pub fn subscribe_link_state(&self, kind: LinkKind) -> watch::Receiver<ResourceState> {
        match kind {
            LinkKind::EventSend => self.event_sender.subscribe_state(),
            LinkKind::CommandReceive => self.command_receiver.subscribe_state(),
            LinkKind::MethodSend => self.method_sender.subscribe_state(),
            LinkKind::MethodReceive => self.method_receiver.subscribe_state(),
        }
    }

    /// Opens the event and command links concurrently.
    ///
    /// With `explicit_open == false` nothing happens: links are then created by
    /// the first operation that needs them. Both links share `timeout`. If either
    /// fails the call fails, and a link that did open stays open for reuse.
    pub async fn open(
        &self,
        explicit_open: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !explicit_open {
            debug!("Links of device '{}' open on first use", self.device_id());
            return Ok(());
        }

        let (events, commands) = tokio::join!(
            self.event_sender.get_or_create(timeout, cancel),
            self.command_receiver.get_or_create(timeout, cancel),
        );
        events?;
        commands?;
        info!("Transport for device '{}' opened", self.device_id());
        Ok(())
    }

    /// Sends one telemetry message.
    pub async fn send_event(
        &self,
        message: &Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let wire = self.converter.to_wire(message)?;
        self.send_on(&self.event_sender, "send event", wire, timeout, cancel)
            .await
    }

    /// Sends several messages as one batched delivery.
    pub async fn send_events(
        &self,
        messages: &[Message],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if messages.is_empty() {
            return Err(TransportError::Usage("no messages to send".to_string()));
        }
        let envelopes = messages
            .iter()
            .map(|message| self.converter.to_wire(message))
            .collect::<Result<Vec<_>, _>>()?;
        self.send_on(
            &self.event_sender,
            "send events",
            WireMessage::batch(envelopes),
            timeout,
            cancel,
        )
        .await
    }

    /// Waits up to `timeout` for the next command.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. A delivery that cannot be
    /// decoded is rejected on the link before the error is returned. Creating the command link,
    /// when needed, is bounded by the configured open timeout instead.
    pub async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<ReceivedMessage>, TransportError> {
        self.ensure_open()?;
        let link = self
            .link(&self.command_receiver, self.config().open_timeout(), cancel)
            .await?;

        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            received = tokio::time::timeout(timeout, link.receive(timeout)) => match received {
                Ok(result) => result.map_err(|e| TransportError::from_engine("receive", e))?,
                Err(_) => None,
            },
        };
        let Some(delivery) = delivery else {
            return Ok(None);
        };

        let decoded = match LockToken::from_delivery_tag(&delivery.tag) {
            Ok(lock_token) => self
                .converter
                .from_wire(delivery.message)
                .map(|message| (lock_token, message)),
            Err(e) => Err(e),
        };
        let (lock_token, message) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Rejecting undecodable command: {}", e);
                link.dispose(
                    &delivery.tag,
                    Outcome::Rejected(Some(
                        ErrorCondition::new(DECODE_ERROR).with_description(e.to_string()),
                    )),
                );
                return Err(e);
            }
        };
        debug!("Received message with lock token {}", lock_token);
        Ok(Some(ReceivedMessage {
            message,
            lock_token,
        }))
    }

    /// Settles a received message.
    ///
    /// The lock token is validated before any I/O. A rejection because the lock
    /// no longer exists surfaces as `TransportError::LockLost`.
    pub async fn settle_message(
        &self,
        lock_token: &str,
        disposition: Disposition,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let tag = convert_to_delivery_tag(lock_token)?;
        let timeout = self.config().operation_timeout();
        let deadline = Deadline::after(timeout);
        let link = self.link(&self.command_receiver, timeout, cancel).await?;

        let requested = match disposition {
            Disposition::Accepted => Outcome::Accepted,
            Disposition::Released => Outcome::Released,
            Disposition::Rejected => Outcome::Rejected(None),
        };
        let remaining = deadline.remaining_for("settle message")?;
        let remote = bounded(
            "settle message",
            remaining,
            cancel,
            link.settle(&tag, requested, remaining),
        )
        .await?;
        debug!(
            "Settled {} as {}, broker answered {}",
            lock_token.trim(),
            disposition.as_str(),
            remote.as_str()
        );
        settlement_result(disposition, remote)
    }

    /// Accepts a received message.
    pub async fn complete(&self, lock_token: &str, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.settle_message(lock_token, Disposition::Accepted, cancel)
            .await
    }

    /// Releases a received message for redelivery.
    pub async fn abandon(&self, lock_token: &str, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.settle_message(lock_token, Disposition::Released, cancel)
            .await
    }

    /// Rejects (dead-letters) a received message.
    pub async fn reject(&self, lock_token: &str, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.settle_message(lock_token, Disposition::Rejected, cancel)
            .await
    }

    /// Opens both method links and routes inbound requests to `handler`.
    ///
    /// # Returns
    /// - `Ok(())`: Both method links are open
    /// - `Err(TransportError::Usage)`: Methods are disabled in configuration
    /// - `Err(_)`: Opening a link failed; the other link stays open
    pub async fn enable_methods(
        &self,
        handler: MethodHandler,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.ensure_methods_allowed()?;

        *self
            .method_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);

        let (sender, receiver) = tokio::join!(
            self.method_sender.get_or_create(timeout, cancel),
            self.method_receiver.get_or_create(timeout, cancel),
        );
        sender?;
        receiver?;
        self.methods_active.store(true, Ordering::Release);
        info!("Methods enabled for device '{}'", self.device_id());
        Ok(())
    }

    /// Closes both method links, including one left open by a failed
    /// `enable_methods`.
    pub async fn disable_methods(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let was_active = self.methods_active.swap(false, Ordering::AcqRel);
        tokio::join!(self.method_sender.close(), self.method_receiver.close());
        *self
            .method_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        if was_active {
            info!("Methods disabled for device '{}'", self.device_id());
        }
        Ok(())
    }

    /// Sends the response to a method request.
    pub async fn send_method_response(
        &self,
        response: &MethodResponse,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.ensure_methods_allowed()?;
        if !self.methods_active.load(Ordering::Acquire) {
            return Err(TransportError::Usage(
                "methods are not enabled, call enable_methods first".to_string(),
            ));
        }
        let wire = self.converter.method_response_to_wire(response)?;
        self.send_on(&self.method_sender, "send method response", wire, timeout, cancel)
            .await
    }

    /// Closes every link and releases the device's connection.
    ///
    /// Safe to call any number of times from any number of tasks: the teardown
    /// runs once and every caller returns after it finished. Close failures are
    /// logged and otherwise ignored.
    pub async fn close(&self) {
        self.closed
            .get_or_init(|| async {
                self.closing.store(true, Ordering::Release);
                info!("Closing transport for device '{}'", self.device_id());
                tokio::join!(
                    self.event_sender.close(),
                    self.command_receiver.close(),
                    self.method_sender.close(),
                    self.method_receiver.close(),
                );
                self.connection.release().await;
                info!("Transport for device '{}' closed", self.device_id());
            })
            .await;
    }

    /// Runs `f` and closes the orchestrator afterwards, whatever `f` returned.
    pub async fn scoped<F, Fut, R>(self: Arc<Self>, f: F) -> R
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = R>,
    {
        let result = f(self.clone()).await;
        self.close().await;
        result
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn ensure_methods_allowed(&self) -> Result<(), TransportError> {
        if !self.config().methods_enabled {
            return Err(TransportError::Usage(
                "methods are disabled by configuration".to_string(),
            ));
        }
        Ok(())
    }

    /// Fast path first, creation only when the slot has no open link.
    async fn link<T>(
        &self,
        slot: &FaultTolerantResource<T>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError>
    where
        T: Clone + Send + Sync + 'static,
    {
        match slot.try_get_opened() {
            Some(link) => Ok(link),
            None => slot.get_or_create(timeout, cancel).await,
        }
    }

    async fn send_on(
        &self,
        slot: &FaultTolerantResource<Arc<dyn SenderLink>>,
        operation: &'static str,
        wire: WireMessage,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let deadline = Deadline::after(timeout);
        let link = self.link(slot, timeout, cancel).await?;
        let remaining = deadline.remaining_for(operation)?;
        let outcome = bounded(
            operation,
            remaining,
            cancel,
            link.send(wire, DeliveryTag::random(), remaining),
        )
        .await?;
        send_result(outcome)
    }
}

impl Drop for LinkOrchestrator {
    fn drop(&mut self) {
        if self.closed.get().is_none() {
            warn!(
                "Transport for device '{}' dropped without close, links are left to the engine",
                self.device_id()
            );
        }
    }
}

fn send_result(outcome: Outcome) -> Result<(), TransportError> {
    match outcome {
        Outcome::Accepted => Ok(()),
        Outcome::Rejected(condition) => Err(TransportError::from_rejection(condition.into())),
        Outcome::Released => Err(TransportError::Released),
    }
}

fn settlement_result(requested: Disposition, remote: Outcome) -> Result<(), TransportError> {
    match remote {
        Outcome::Rejected(Some(condition)) if condition.condition == NOT_FOUND => Err(
            TransportError::from_settlement_rejection(Some(condition).into()),
        ),
        remote if remote.as_str() == requested.as_str() => Ok(()),
        Outcome::Rejected(condition) => {
            Err(TransportError::from_settlement_rejection(condition.into()))
        }
        Outcome::Released => Err(TransportError::Released),
        Outcome::Accepted => Ok(()),
    }
}

async fn close_sender(link: Arc<dyn SenderLink>, timeout: Duration) {
    if let Err(e) = link.close(timeout).await {
        warn!("Failed to close sending link '{}': {}", link.name(), e);
    }
}

async fn close_receiver(link: Arc<dyn ReceiverLink>, timeout: Duration) {
    if let Err(e) = link.close(timeout).await {
        warn!("Failed to close receiving link '{}': {}", link.name(), e);
    }
}

/// Dispatches method requests and accepts each one after the handler ran.
fn method_listener(
    link: Weak<dyn ReceiverLink>,
    handler: MethodHandler,
    converter: Arc<dyn MessageConverter>,
) -> DeliveryListener {
    Arc::new(move |delivery: Delivery| {
        let outcome = match converter.method_request_from_wire(delivery.message) {
            Ok(request) => {
                debug!("Dispatching method '{}' ({})", request.name, request.request_id);
                handler(request);
                Outcome::Accepted
            }
            Err(e) => {
                warn!("Rejecting malformed method request: {}", e);
                Outcome::Rejected(Some(
                    ErrorCondition::new(DECODE_ERROR).with_description(e.to_string()),
                ))
            }
        };
        if let Some(link) = link.upgrade() {
            link.dispose(&delivery.tag, outcome);
        }
    })
}
