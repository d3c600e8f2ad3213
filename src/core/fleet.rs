//! The set of device transports run by this process.
//!
//! `DeviceFleet` builds one `LinkOrchestrator` per configured device on top of a
//! single `ConnectionRegistry`, so devices on the same hub share a connection
//! when pooling is enabled. Shutdown closes every device before the registry.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use futures_util::future::join_all;
use hublink_amqp::{
    engine::ProtocolEngine, ConnectionRegistry, DefaultMessageConverter, LinkKind,
    LinkOrchestrator, MessageConverter, TransportError,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::readiness::Readiness;
use crate::config::Config;

pub struct DeviceFleet {
    registry: Arc<ConnectionRegistry>,
    devices: Vec<Arc<LinkOrchestrator>>,
    readiness: Mutex<HashMap<String, Readiness>>,
}

impl DeviceFleet {
    /// Builds a transport for every device in `config`. Nothing is opened yet.
    pub fn new(config: &Config, engine: Arc<dyn ProtocolEngine>) -> Result<Self, TransportError> {
        Self::with_converter(config, engine, Arc::new(DefaultMessageConverter))
    }

    pub fn with_converter(
        config: &Config,
        engine: Arc<dyn ProtocolEngine>,
        converter: Arc<dyn MessageConverter>,
    ) -> Result<Self, TransportError> {
        let registry = Arc::new(ConnectionRegistry::new(
            engine,
            config.transport.close_timeout(),
        ));

        let mut devices = Vec::with_capacity(config.devices.len());
        for device in &config.devices {
            let orchestrator = LinkOrchestrator::new(
                device.identity(),
                config.transport.clone(),
                registry.clone(),
                converter.clone(),
            )?;
            devices.push(Arc::new(orchestrator));
        }

        info!("Device fleet created with {} device(s)", devices.len());
        Ok(Self {
            registry,
            devices,
            readiness: Mutex::new(HashMap::new()),
        })
    }

    pub fn devices(&self) -> &[Arc<LinkOrchestrator>] {
        &self.devices
    }

    pub fn device(&self, device_id: &str) -> Option<&Arc<LinkOrchestrator>> {
        self.devices.iter().find(|d| d.device_id() == device_id)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Opens every device concurrently, each within its configured open timeout.
    ///
    /// Failures are logged and returned per device; one device failing does not
    /// stop the others.
    pub async fn open_all(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<(), TransportError>)> {
        let opens = self.devices.iter().map(|device| async move {
            let timeout = device.config().open_timeout();
            let result = device.open(true, timeout, cancel).await;
            if let Err(e) = &result {
                error!("Failed to open device '{}': {}", device.device_id(), e);
            }
            (device.device_id().to_string(), result)
        });
        join_all(opens).await
    }

    /// Readiness of one device, following its event-sending link.
    ///
    /// The tracker is created on first use; later calls return clones of it.
    /// Must be called inside a Tokio runtime.
    pub fn readiness(&self, device_id: &str) -> Option<Readiness> {
        let device = self.device(device_id)?;
        let mut trackers = self.readiness.lock().unwrap_or_else(PoisonError::into_inner);
        let readiness = trackers.entry(device_id.to_string()).or_insert_with(|| {
            let readiness = Readiness::new();
            readiness.start_listening(device.subscribe_link_state(LinkKind::EventSend));
            readiness
        });
        Some(readiness.clone())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down device fleet");
        join_all(self.devices.iter().map(|device| device.close())).await;
        self.registry.shutdown().await;
        info!("Device fleet shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hublink_amqp::{
        engine::mock::{MockEngine, MockState},
        Message, TransportKind,
    };

    use tracing_test::traced_test;

    use super::*;
    use crate::core::readiness::ReadinessState;

    const TWO_DEVICES: &str = r#"
[[devices]]
host_name = "hub.example.net"
device_id = "sensor-1"
shared_access_signature = "sig-1"

[[devices]]
host_name = "hub.example.net"
device_id = "sensor-2"
shared_access_signature = "sig-2"
"#;

    fn fleet(config: &str) -> (DeviceFleet, MockEngine) {
        let config = Config::parse(config).unwrap();
        let engine = MockEngine::new();
        let fleet = DeviceFleet::new(&config, Arc::new(engine.clone())).unwrap();
        (fleet, engine)
    }

    #[tokio::test]
    async fn test_devices_share_one_connection() {
        let (fleet, engine) = fleet(TWO_DEVICES);
        let cancel = CancellationToken::new();

        let results = fleet.open_all(&cancel).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(MockState::count(&engine.state.connects), 1);
        assert_eq!(fleet.registry().active_connections(), 1);

        fleet.shutdown().await;
        assert_eq!(MockState::count(&engine.state.connection_closes), 1);
        assert!(fleet.devices().iter().all(|d| d.is_closed()));
    }

    #[tokio::test]
    async fn test_device_lookup_and_send() {
        let (fleet, engine) = fleet(TWO_DEVICES);
        let cancel = CancellationToken::new();

        let device = fleet.device("sensor-2").unwrap();
        device
            .send_event(&Message::new("21.5"), Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(engine.state.control().sent.len(), 1);
        assert!(fleet.device("sensor-9").is_none());

        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_readiness_follows_event_link() {
        let (fleet, _engine) = fleet(TWO_DEVICES);
        let cancel = CancellationToken::new();

        let readiness = fleet.readiness("sensor-1").unwrap();
        fleet.open_all(&cancel).await;
        tokio::time::timeout(Duration::from_secs(1), readiness.wait_ready())
            .await
            .unwrap();

        fleet.shutdown().await;
        let mut rx = readiness.subscribe();
        let state = rx.wait_for(|s| !s.is_ready()).await.unwrap().clone();
        assert!(!state.is_ready());
        assert!(fleet.readiness("missing").is_none());
    }

    #[tokio::test]
    async fn test_readiness_is_shared_per_device() {
        let (fleet, _engine) = fleet(TWO_DEVICES);

        let first = fleet.readiness("sensor-1").unwrap();
        let second = fleet.readiness("sensor-1").unwrap();
        let other = fleet.readiness("sensor-2").unwrap();

        let reason = ReadinessState::NotReadyYet("maintenance".into());
        first.set_state(reason.clone());
        assert_eq!(second.current_state(), reason);
        assert_ne!(other.current_state(), reason);

        fleet.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shutdown_is_logged() {
        let (fleet, _engine) = fleet(TWO_DEVICES);
        fleet.open_all(&CancellationToken::new()).await;
        fleet.shutdown().await;
        assert!(logs_contain("Shutting down device fleet"));
        assert!(logs_contain("Device fleet shut down"));
    }

    #[tokio::test]
    async fn test_invalid_transport_config_is_rejected() {
        let mut config = Config::parse(TWO_DEVICES).unwrap();
        config.transport.open_timeout = 0;
        let result = DeviceFleet::new(&config, Arc::new(MockEngine::new()));
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unpooled_websocket_devices_connect_separately() {
        let config = format!(
            "[transport]\ntransport = \"websocket\"\nconnection_pooling = false\n{}",
            TWO_DEVICES
        );
        let (fleet, engine) = fleet(&config);
        let cancel = CancellationToken::new();

        fleet.open_all(&cancel).await;
        assert_eq!(MockState::count(&engine.state.connects), 2);
        assert_eq!(
            fleet.devices()[0].config().transport,
            TransportKind::WebSocket
        );

        fleet.shutdown().await;
        assert_eq!(MockState::count(&engine.state.connection_closes), 2);
    }
}
