//! In-memory protocol engine for tests (enabled by the `test-util` feature).
//!
//! Every object records what the transport asked of it; tests inject delays,
//! failures, outcomes and inbound deliveries through `MockState::control`.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{
    Connection, Delivery, DeliveryListener, DeliveryTag, EndpointState, EngineError, EngineErrorKind,
    LinkSettings, Outcome, ProtocolEngine, ReceiverLink, SenderLink, Session, WireMessage,
};
use crate::transport::{Credential, TransportSettings};

#[derive(Default)]
pub struct Control {
    pub connect_delay: Duration,
    pub session_open_delay: Duration,
    pub link_open_delay: Duration,
    pub connect_error: Option<EngineError>,
    /// Links whose address contains one of these fragments fail to attach.
    pub failing_link_addresses: Vec<String>,
    pub send_outcomes: VecDeque<Outcome>,
    pub settle_outcomes: VecDeque<Outcome>,
    pub inbound: VecDeque<Delivery>,

    pub connect_settings: Vec<TransportSettings>,
    pub authorized: Vec<String>,
    pub link_open_timeouts: Vec<(String, Duration)>,
    pub sent: Vec<(String, WireMessage, DeliveryTag)>,
    pub settled: Vec<(DeliveryTag, Outcome)>,
    pub disposed: Vec<(DeliveryTag, Outcome)>,
    pub sessions: Vec<Arc<MockSession>>,
    pub senders: Vec<Arc<MockSender>>,
    pub receivers: Vec<Arc<MockReceiver>>,
}

#[derive(Default)]
pub struct MockState {
    pub connects: AtomicUsize,
    pub connection_closes: AtomicUsize,
    pub sessions_created: AtomicUsize,
    pub session_ends: AtomicUsize,
    pub links_opened: AtomicUsize,
    pub link_closes: AtomicUsize,
    /// Number of upcoming sessions that report `Closed` right after opening.
    pub terminal_sessions: AtomicUsize,
    control: Mutex<Control>,
}

impl MockState {
    pub fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn sender_for(&self, fragment: &str) -> Option<Arc<MockSender>> {
        self.control()
            .senders
            .iter()
            .rev()
            .find(|s| s.settings.address.contains(fragment))
            .cloned()
    }

    pub fn receiver_for(&self, fragment: &str) -> Option<Arc<MockReceiver>> {
        self.control()
            .receivers
            .iter()
            .rev()
            .find(|r| r.settings.address.contains(fragment))
            .cloned()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.control().sessions.last().cloned()
    }

    async fn open_link(
        &self,
        settings: &LinkSettings,
        state: &Mutex<EndpointState>,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let (delay, fails) = {
            let mut control = self.control();
            control
                .link_open_timeouts
                .push((settings.address.clone(), timeout));
            let fails = control
                .failing_link_addresses
                .iter()
                .any(|fragment| settings.address.contains(fragment.as_str()));
            (control.link_open_delay, fails)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fails {
            *state.lock().unwrap_or_else(PoisonError::into_inner) = EndpointState::Faulted;
            return Err(EngineError::new(EngineErrorKind::Detached, "attach refused"));
        }
        *state.lock().unwrap_or_else(PoisonError::into_inner) = EndpointState::Opened;
        self.links_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockEngine {
    pub state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn connect(
        &self,
        settings: &TransportSettings,
        _timeout: Duration,
    ) -> Result<Arc<dyn Connection>, EngineError> {
        let (error, delay) = {
            let mut control = self.state.control();
            control.connect_settings.push(settings.clone());
            (control.connect_error.clone(), control.connect_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(error);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection {
            closed: AtomicBool::new(false),
            mock: self.state.clone(),
        }))
    }
}

pub struct MockConnection {
    closed: AtomicBool,
    mock: Arc<MockState>,
}

#[async_trait]
impl Connection for MockConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn authorize(
        &self,
        audience: &str,
        _credential: &Credential,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        self.mock.control().authorized.push(audience.to_string());
        Ok(())
    }

    fn create_session(&self) -> Result<Arc<dyn Session>, EngineError> {
        let session = Arc::new(MockSession {
            state: Mutex::new(EndpointState::Opening),
            mock: self.mock.clone(),
        });
        self.mock.sessions_created.fetch_add(1, Ordering::SeqCst);
        self.mock.control().sessions.push(session.clone());
        Ok(session)
    }

    async fn close(&self, _timeout: Duration) -> Result<(), EngineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.mock.connection_closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct MockSession {
    state: Mutex<EndpointState>,
    mock: Arc<MockState>,
}

impl MockSession {
    pub fn set_state(&self, state: EndpointState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[async_trait]
impl Session for MockSession {
    fn state(&self) -> EndpointState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(&self, _timeout: Duration) -> Result<(), EngineError> {
        let delay = self.mock.control().session_open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let terminal = self
            .mock
            .terminal_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.set_state(if terminal {
            EndpointState::Closed
        } else {
            EndpointState::Opened
        });
        Ok(())
    }

    fn create_sender(&self, settings: LinkSettings) -> Result<Arc<dyn SenderLink>, EngineError> {
        let sender = Arc::new(MockSender {
            settings,
            state: Mutex::new(EndpointState::Opening),
            mock: self.mock.clone(),
        });
        self.mock.control().senders.push(sender.clone());
        Ok(sender)
    }

    fn create_receiver(
        &self,
        settings: LinkSettings,
    ) -> Result<Arc<dyn ReceiverLink>, EngineError> {
        let receiver = Arc::new(MockReceiver {
            settings,
            state: Mutex::new(EndpointState::Opening),
            listener: Mutex::new(None),
            mock: self.mock.clone(),
        });
        self.mock.control().receivers.push(receiver.clone());
        Ok(receiver)
    }

    async fn end(&self, _timeout: Duration) -> Result<(), EngineError> {
        self.set_state(EndpointState::Closed);
        self.mock.session_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockSender {
    pub settings: LinkSettings,
    state: Mutex<EndpointState>,
    mock: Arc<MockState>,
}

impl MockSender {
    pub fn fault(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = EndpointState::Faulted;
    }
}

#[async_trait]
impl SenderLink for MockSender {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn state(&self) -> EndpointState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(&self, timeout: Duration) -> Result<(), EngineError> {
        self.mock.open_link(&self.settings, &self.state, timeout).await
    }

    async fn send(
        &self,
        message: WireMessage,
        tag: DeliveryTag,
        _timeout: Duration,
    ) -> Result<Outcome, EngineError> {
        if !self.state().is_open() {
            return Err(EngineError::new(EngineErrorKind::Detached, "link detached"));
        }
        let mut control = self.mock.control();
        control
            .sent
            .push((self.settings.address.clone(), message, tag));
        Ok(control.send_outcomes.pop_front().unwrap_or(Outcome::Accepted))
    }

    async fn close(&self, _timeout: Duration) -> Result<(), EngineError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = EndpointState::Closed;
        self.mock.link_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockReceiver {
    pub settings: LinkSettings,
    state: Mutex<EndpointState>,
    listener: Mutex<Option<DeliveryListener>>,
    mock: Arc<MockState>,
}

impl MockReceiver {
    /// Pushes a delivery to the registered listener. Returns false without one.
    pub fn deliver(&self, delivery: Delivery) -> bool {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match listener {
            Some(listener) => {
                listener(delivery);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ReceiverLink for MockReceiver {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn state(&self) -> EndpointState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(&self, timeout: Duration) -> Result<(), EngineError> {
        self.mock.open_link(&self.settings, &self.state, timeout).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, EngineError> {
        let queued = self.mock.control().inbound.pop_front();
        if queued.is_some() {
            return Ok(queued);
        }
        tokio::time::sleep(timeout).await;
        Ok(self.mock.control().inbound.pop_front())
    }

    async fn settle(
        &self,
        tag: &DeliveryTag,
        outcome: Outcome,
        _timeout: Duration,
    ) -> Result<Outcome, EngineError> {
        let mut control = self.mock.control();
        control.settled.push((tag.clone(), outcome));
        Ok(control
            .settle_outcomes
            .pop_front()
            .unwrap_or(Outcome::Accepted))
    }

    fn register_listener(&self, listener: DeliveryListener) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn dispose(&self, tag: &DeliveryTag, outcome: Outcome) {
        self.mock.control().disposed.push((tag.clone(), outcome));
    }

    async fn close(&self, _timeout: Duration) -> Result<(), EngineError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = EndpointState::Closed;
        self.mock.link_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
