//! Shared connections and their reference counting.
//!
//! Opening a connection costs a socket, a TLS handshake and a protocol
//! handshake. Devices that talk to the same hub over the same transport
//! therefore share one connection. The `ConnectionRegistry` maps a
//! `ConnectionKey` to a `ConnectionHandle` and tracks which devices use it; the
//! connection is closed when the last device releases it.
//!
//! The registry is an ordinary value. Create one per process (or per test) and
//! hand it to every `ConnectionManager`:
//!
//! ```ignore
//! let registry = Arc::new(ConnectionRegistry::new(engine, config.close_timeout()));
//! let first = LinkOrchestrator::new(device_a, config.clone(), registry.clone(), converter.clone())?;
//! let second = LinkOrchestrator::new(device_b, config, registry.clone(), converter)?;
//! // ... both devices share one connection ...
//! registry.shutdown().await;
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    config::Config,
    deadline::bounded,
    engine::{Connection, ProtocolEngine},
    error::TransportError,
    resource::FaultTolerantResource,
    state::ResourceState,
    transport::{DeviceIdentity, TransportKind},
};

/// Identifies one shareable connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,

    /// Set when pooling is disabled: the connection then belongs to this device only.
    pub device_scope: Option<String>,
}

impl ConnectionKey {
    /// Key under which `identity` looks up its connection.
    pub fn for_device(identity: &DeviceIdentity, config: &Config) -> Self {
        Self {
            host: identity.host_name.clone(),
            port: config.port(),
            transport: config.transport,
            device_scope: (!config.connection_pooling).then(|| identity.device_id.clone()),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.host, self.port)?;
        if let Some(device) = &self.device_scope {
            write!(f, " [{device}]")?;
        }
        Ok(())
    }
}

/// A shared, lazily opened connection.
///
/// Once the registry retires a handle (last device released, or shutdown) it
/// never connects again; devices still holding it get `Closed`.
pub struct ConnectionHandle {
    key: ConnectionKey,
    resource: FaultTolerantResource<Arc<dyn Connection>>,
    retired: Arc<AtomicBool>,
}

impl ConnectionHandle {
    fn new(key: ConnectionKey, engine: Arc<dyn ProtocolEngine>, close_timeout: Duration) -> Self {
        let settings = key.transport.settings(&key.host, key.port);
        let retired = Arc::new(AtomicBool::new(false));
        let factory_retired = retired.clone();
        let resource = FaultTolerantResource::new(
            "connection",
            move |timeout, cancel: CancellationToken| {
                let engine = engine.clone();
                let settings = settings.clone();
                let retired = factory_retired.clone();
                async move {
                    if retired.load(Ordering::Acquire) {
                        return Err(TransportError::Closed);
                    }
                    debug!("Connecting to {}", settings.uri());
                    bounded(
                        "open connection",
                        timeout,
                        &cancel,
                        engine.connect(&settings, timeout),
                    )
                    .await
                }
            },
            move |connection: Arc<dyn Connection>| async move {
                if let Err(e) = connection.close(close_timeout).await {
                    warn!("Failed to close connection cleanly: {}", e);
                }
            },
            |connection: &Arc<dyn Connection>| !connection.is_closed(),
        );
        Self {
            key,
            resource,
            retired,
        }
    }

    /// Returns the open connection, connecting first when necessary.
    pub async fn connection(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        if self.is_retired() {
            return Err(TransportError::Closed);
        }
        self.resource.get_or_create(timeout, cancel).await
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.key.host
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    pub fn transport(&self) -> TransportKind {
        self.key.transport
    }

    pub fn state(&self) -> ResourceState {
        self.resource.state()
    }

    /// Marks the handle retired, then closes the connection.
    async fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.resource.close().await;
    }
}

struct Entry {
    handle: Arc<ConnectionHandle>,
    /// Outstanding acquisitions per device.
    devices: HashMap<String, usize>,
}

/// Reference-counted cache of shared connections.
pub struct ConnectionRegistry {
    engine: Arc<dyn ProtocolEngine>,
    close_timeout: Duration,
    entries: Mutex<HashMap<ConnectionKey, Entry>>,
}

impl ConnectionRegistry {
    pub fn new(engine: Arc<dyn ProtocolEngine>, close_timeout: Duration) -> Self {
        Self {
            engine,
            close_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the connection handle for `key` and records `device_id` as a user.
    ///
    /// No I/O happens here; the connection opens on first use.
    pub fn acquire(&self, key: &ConnectionKey, device_id: &str) -> Arc<ConnectionHandle> {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            info!("Registering connection {}", key);
            Entry {
                handle: Arc::new(ConnectionHandle::new(
                    key.clone(),
                    self.engine.clone(),
                    self.close_timeout,
                )),
                devices: HashMap::new(),
            }
        });
        *entry.devices.entry(device_id.to_string()).or_default() += 1;
        debug!(
            "Device '{}' acquired connection {} ({} device(s))",
            device_id,
            key,
            entry.devices.len()
        );
        entry.handle.clone()
    }

    /// Drops one acquisition of `key` by `device_id`.
    ///
    /// The connection is closed and forgotten once no device uses it anymore.
    /// Releasing an unknown key or device is a no-op.
    pub async fn release(&self, key: &ConnectionKey, device_id: &str) {
        let retired = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(key) else {
                debug!("Release of unknown connection {} ignored", key);
                return;
            };
            if let Some(count) = entry.devices.get_mut(device_id) {
                *count -= 1;
                if *count == 0 {
                    entry.devices.remove(device_id);
                }
            }
            debug!(
                "Device '{}' released connection {} ({} device(s) left)",
                device_id,
                key,
                entry.devices.len()
            );
            if entry.devices.is_empty() {
                entries.remove(key).map(|entry| entry.handle)
            } else {
                None
            }
        };

        if let Some(handle) = retired {
            handle.retire().await;
            info!("Connection {} closed, no device uses it anymore", key);
        }
    }

    /// Closes every remaining connection, whoever still uses it.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .entries()
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect();
        if handles.is_empty() {
            return;
        }
        info!("Shutting down {} connection(s)", handles.len());
        futures_util::future::join_all(handles.iter().map(|handle| handle.retire())).await;
    }

    /// Number of registered connections.
    pub fn active_connections(&self) -> usize {
        self.entries().len()
    }

    /// Number of devices currently using `key`.
    pub fn device_count(&self, key: &ConnectionKey) -> usize {
        self.entries()
            .get(key)
            .map(|entry| entry.devices.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{
            mock::{MockEngine, MockState},
            EngineError, EngineErrorKind,
        },
        transport::Credential,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn identity(device: &str) -> DeviceIdentity {
        DeviceIdentity::new("hub.example.net", device, Credential::new("sas"))
    }

    fn registry(engine: &MockEngine) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(engine.clone()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_devices_share_one_connection() {
        let engine = MockEngine::new();
        let registry = registry(&engine);
        let config = Config::default();
        let cancel = CancellationToken::new();

        let key_a = ConnectionKey::for_device(&identity("a"), &config);
        let key_b = ConnectionKey::for_device(&identity("b"), &config);
        assert_eq!(key_a, key_b);

        let a = registry.acquire(&key_a, "a");
        let b = registry.acquire(&key_b, "b");
        assert!(Arc::ptr_eq(&a, &b));

        let conn_a = a.connection(TIMEOUT, &cancel).await.unwrap();
        let conn_b = b.connection(TIMEOUT, &cancel).await.unwrap();
        assert!(Arc::ptr_eq(&conn_a, &conn_b));
        assert_eq!(MockState::count(&engine.state.connects), 1);
        assert_eq!(registry.device_count(&key_a), 2);

        registry.release(&key_a, "a").await;
        assert_eq!(MockState::count(&engine.state.connection_closes), 0);
        assert!(!conn_b.is_closed());
        assert_eq!(registry.active_connections(), 1);

        registry.release(&key_b, "b").await;
        assert_eq!(MockState::count(&engine.state.connection_closes), 1);
        assert!(conn_b.is_closed());
        assert_eq!(registry.active_connections(), 0);

        // A retired handle never reconnects.
        assert!(b.is_retired());
        let err = b.connection(TIMEOUT, &cancel).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(MockState::count(&engine.state.connects), 1);

        // A new acquisition registers a fresh handle.
        let fresh = registry.acquire(&key_a, "a");
        assert!(!fresh.is_retired());
        fresh.connection(TIMEOUT, &cancel).await.unwrap();
        assert_eq!(MockState::count(&engine.state.connects), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_in_flight_at_release_is_closed() {
        let engine = MockEngine::new();
        let registry = Arc::new(registry(&engine));
        let key = ConnectionKey::for_device(&identity("a"), &Config::default());
        let handle = registry.acquire(&key, "a");
        engine.state.control().connect_delay = Duration::from_millis(100);

        let connecting = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .connection(TIMEOUT, &CancellationToken::new())
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.release(&key, "a").await;

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(MockState::count(&engine.state.connects), 1);
        assert_eq!(MockState::count(&engine.state.connection_closes), 1);
    }

    #[tokio::test]
    async fn test_repeated_acquire_by_one_device_is_counted() {
        let engine = MockEngine::new();
        let registry = registry(&engine);
        let key = ConnectionKey::for_device(&identity("a"), &Config::default());

        registry.acquire(&key, "a");
        registry.acquire(&key, "a");
        registry
            .acquire(&key, "a")
            .connection(TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();

        registry.release(&key, "a").await;
        registry.release(&key, "a").await;
        assert_eq!(registry.active_connections(), 1);

        registry.release(&key, "a").await;
        assert_eq!(registry.active_connections(), 0);
        assert_eq!(MockState::count(&engine.state.connection_closes), 1);
    }

    #[tokio::test]
    async fn test_pooling_disabled_gives_private_connections() {
        let engine = MockEngine::new();
        let registry = registry(&engine);
        let config = Config {
            connection_pooling: false,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let key_a = ConnectionKey::for_device(&identity("a"), &config);
        let key_b = ConnectionKey::for_device(&identity("b"), &config);
        assert_ne!(key_a, key_b);

        let a = registry.acquire(&key_a, "a");
        let b = registry.acquire(&key_b, "b");
        assert!(!Arc::ptr_eq(&a, &b));
        a.connection(TIMEOUT, &cancel).await.unwrap();
        b.connection(TIMEOUT, &cancel).await.unwrap();
        assert_eq!(MockState::count(&engine.state.connects), 2);

        registry.release(&key_a, "a").await;
        assert_eq!(MockState::count(&engine.state.connection_closes), 1);
        assert_eq!(registry.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_release_of_unknown_key_is_noop() {
        let engine = MockEngine::new();
        let registry = registry(&engine);
        let key = ConnectionKey::for_device(&identity("a"), &Config::default());

        registry.release(&key, "a").await;
        assert_eq!(registry.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_is_retried_on_next_use() {
        let engine = MockEngine::new();
        engine.state.control().connect_error =
            Some(EngineError::new(EngineErrorKind::Io, "connection refused"));
        let registry = registry(&engine);
        let key = ConnectionKey::for_device(&identity("a"), &Config::default());
        let handle = registry.acquire(&key, "a");
        let cancel = CancellationToken::new();

        let err = handle.connection(TIMEOUT, &cancel).await.err().unwrap();
        assert!(err.is_transient());
        assert_eq!(handle.state(), ResourceState::Unopened);

        engine.state.control().connect_error = None;
        handle.connection(TIMEOUT, &cancel).await.unwrap();
        assert_eq!(handle.state(), ResourceState::Open);
    }

    #[tokio::test]
    async fn test_websocket_settings_reach_the_engine() {
        let engine = MockEngine::new();
        let registry = registry(&engine);
        let config = Config {
            transport: TransportKind::WebSocket,
            ..Default::default()
        };
        let key = ConnectionKey::for_device(&identity("a"), &config);
        let handle = registry.acquire(&key, "a");
        assert_eq!(handle.port(), 443);

        handle
            .connection(TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        let settings = engine.state.control().connect_settings[0].clone();
        assert_eq!(settings.uri(), "wss://hub.example.net:443/$iothub/websocket");
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let engine = MockEngine::new();
        let registry = registry(&engine);
        let cancel = CancellationToken::new();
        let config = Config {
            connection_pooling: false,
            ..Default::default()
        };

        let mut handles = Vec::new();
        for device in ["a", "b", "c"] {
            let key = ConnectionKey::for_device(&identity(device), &config);
            let handle = registry.acquire(&key, device);
            handle.connection(TIMEOUT, &cancel).await.unwrap();
            handles.push(handle);
        }
        registry.shutdown().await;

        assert_eq!(registry.active_connections(), 0);
        assert!(handles.iter().all(|handle| handle.is_retired()));
        assert_eq!(MockState::count(&engine.state.connection_closes), 3);
    }
}
