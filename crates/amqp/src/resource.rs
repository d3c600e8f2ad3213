//! Lazily created, recreate-on-fault network resources.
//!
//! `FaultTolerantResource<T>` owns at most one live instance of a network object
//! (connection, session or link) and knows how to create and close it. The slot
//! moves between three states:
//!
//! ```text
//!            get_or_create                 factory Ok
//!   Empty ─────────────────▶ Creating ─────────────────▶ Holding(instance, generation)
//!     ▲                         │  factory Err / cancel          │
//!     └─────────────────────────┘                                │
//!     ▲          close / try_remove / fault observed             │
//!     └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one factory call is in flight. Callers arriving while a creation is
//!   running await the same outcome, success or failure.
//! - The slot never keeps an instance that reports itself as no longer open: the
//!   next `get_or_create` closes it in the background and starts a new creation.
//! - An instance created after the slot was closed (creation raced with `close`)
//!   is closed instead of being leaked, and its waiters get `Closed`.
//! - Factory failures are not retried; the slot returns to `Empty` so the next
//!   call can try again.
//!
//! The creation runs on its own task, so a caller giving up on its wait (timeout,
//! cancellation) does not abort a creation other callers are waiting for. The
//! factory itself receives the creator's timeout and cancellation token.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{error::TransportError, state::ResourceState};

type Creation<T> = Shared<BoxFuture<'static, Result<T, TransportError>>>;
type CreateFn<T> =
    Box<dyn Fn(Duration, CancellationToken) -> BoxFuture<'static, Result<T, TransportError>> + Send + Sync>;
type CloseFn<T> = Box<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;
type HealthFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

enum Slot<T> {
    Empty,
    Creating { generation: u64, creation: Creation<T> },
    Holding { instance: T, generation: u64 },
}

struct Inner<T> {
    name: &'static str,
    create: CreateFn<T>,
    close: CloseFn<T>,
    is_open: HealthFn<T>,
    slot: Mutex<Slot<T>>,
    generation: AtomicU64,
    state_tx: watch::Sender<ResourceState>,
}

/// A singly-owned network resource that is created on demand and recreated
/// after a fault.
///
/// Cloning is cheap and yields another handle to the same slot.
pub struct FaultTolerantResource<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FaultTolerantResource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FaultTolerantResource<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty slot.
    ///
    /// # Arguments
    /// - `name`: Used in logs and timeout errors
    /// - `create`: Asynchronous factory receiving the creator's timeout and cancellation
    /// - `close`: Best-effort close of an instance leaving the slot
    /// - `is_open`: Cheap, non-blocking health check of a held instance
    pub fn new<C, CFut, D, DFut, P>(name: &'static str, create: C, close: D, is_open: P) -> Self
    where
        C: Fn(Duration, CancellationToken) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<T, TransportError>> + Send + 'static,
        D: Fn(T) -> DFut + Send + Sync + 'static,
        DFut: Future<Output = ()> + Send + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (state_tx, _) = watch::channel(ResourceState::Unopened);
        Self {
            inner: Arc::new(Inner {
                name,
                create: Box::new(move |timeout, cancel| create(timeout, cancel).boxed()),
                close: Box::new(move |instance| close(instance).boxed()),
                is_open: Box::new(is_open),
                slot: Mutex::new(Slot::Empty),
                generation: AtomicU64::new(0),
                state_tx,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Returns the held instance, creating it first when necessary.
    ///
    /// Waits at most `timeout` and stops waiting when `cancel` fires. A caller that
    /// stops waiting does not abort a creation started by someone else.
    pub async fn get_or_create(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError> {
        let (creation, stale) = {
            let mut slot = self.inner.lock_slot();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Holding {
                    instance,
                    generation,
                } if (self.inner.is_open)(&instance) => {
                    *slot = Slot::Holding {
                        instance: instance.clone(),
                        generation,
                    };
                    return Ok(instance);
                }
                Slot::Holding {
                    instance,
                    generation,
                } => {
                    debug!(
                        "{} generation {} is no longer open, recreating",
                        self.inner.name, generation
                    );
                    let creation = self.inner.begin_creation(&mut slot, timeout, cancel.clone());
                    (creation, Some((instance, generation)))
                }
                Slot::Creating {
                    generation,
                    creation,
                } => {
                    *slot = Slot::Creating {
                        generation,
                        creation: creation.clone(),
                    };
                    (creation, None)
                }
                Slot::Empty => (
                    self.inner.begin_creation(&mut slot, timeout, cancel.clone()),
                    None,
                ),
            }
        };
        if let Some((instance, generation)) = stale {
            self.inner.discard(instance, generation);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(timeout, creation) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout {
                    operation: self.inner.name,
                    after: timeout,
                }),
            },
        }
    }

    /// Non-blocking fast path: the held instance if it is still open.
    pub fn try_get_opened(&self) -> Option<T> {
        let slot = self.inner.lock_slot();
        match &*slot {
            Slot::Holding { instance, .. } if (self.inner.is_open)(instance) => Some(instance.clone()),
            _ => None,
        }
    }

    /// Clears the slot if it holds an instance that is no longer open.
    ///
    /// Returns `true` when an instance was removed; it is closed in the
    /// background. A healthy instance is never removed.
    pub fn try_remove(&self) -> bool {
        let removed = {
            let mut slot = self.inner.lock_slot();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Holding {
                    instance,
                    generation,
                } if !(self.inner.is_open)(&instance) => {
                    self.inner.set_state(ResourceState::Unopened);
                    Some((instance, generation))
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };
        match removed {
            Some((instance, generation)) => {
                debug!("{} removed after fault", self.inner.name);
                self.inner.discard(instance, generation);
                true
            }
            None => false,
        }
    }

    /// Closes the held instance, if any, and empties the slot.
    ///
    /// Idempotent: concurrent or repeated calls close the instance at most once.
    /// A creation still in flight is abandoned; its instance is closed as soon as
    /// it arrives.
    pub async fn close(&self) {
        let held = {
            let mut slot = self.inner.lock_slot();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Holding {
                    instance,
                    generation,
                } => Some((instance, generation)),
                Slot::Creating { generation, .. } => {
                    debug!(
                        "{} closed while creation {} was in flight",
                        self.inner.name, generation
                    );
                    None
                }
                Slot::Empty => None,
            }
        };

        if let Some((instance, generation)) = held {
            self.inner.set_state(ResourceState::Closing);
            (self.inner.close)(instance).await;
            info!("{} generation {} closed", self.inner.name, generation);
        }
        self.inner.set_state(ResourceState::Closed);
    }

    /// Generation of the held instance. Every successful creation gets a new one.
    pub fn generation(&self) -> Option<u64> {
        match &*self.inner.lock_slot() {
            Slot::Holding { generation, .. } => Some(*generation),
            _ => None,
        }
    }

    pub fn state(&self) -> ResourceState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ResourceState> {
        self.inner.state_tx.subscribe()
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn lock_slot(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ResourceState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("{} state changed to {}", self.name, state);
        }
    }

    /// Starts a creation episode. Must be called with the slot lock held.
    fn begin_creation(
        self: &Arc<Self>,
        slot: &mut Slot<T>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Creation<T> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Creating {} (generation {})", self.name, generation);

        let create = (self.create)(timeout, cancel);
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = create.await;
            inner.finish_creation(generation, result).await
        });

        let inner = Arc::clone(self);
        let creation = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    inner.abandon_creation(generation);
                    Err(TransportError::Fatal(format!(
                        "creation of {} aborted: {e}",
                        inner.name
                    )))
                }
            }
        }
        .boxed()
        .shared();

        *slot = Slot::Creating {
            generation,
            creation: creation.clone(),
        };
        self.set_state(ResourceState::Opening);
        creation
    }

    /// Installs the outcome of creation `generation`. An instance whose slot was
    /// closed meanwhile is closed here and reported as `Closed`.
    async fn finish_creation(
        &self,
        generation: u64,
        result: Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let orphan = {
            let mut slot = self.lock_slot();
            let current = matches!(
                &*slot,
                Slot::Creating { generation: g, .. } if *g == generation
            );
            match (current, &result) {
                (true, Ok(instance)) => {
                    *slot = Slot::Holding {
                        instance: instance.clone(),
                        generation,
                    };
                    self.set_state(ResourceState::Open);
                    info!("{} opened (generation {})", self.name, generation);
                    None
                }
                (true, Err(e)) => {
                    *slot = Slot::Empty;
                    self.set_state(ResourceState::Unopened);
                    warn!("Failed to open {}: {}", self.name, e);
                    None
                }
                (false, Ok(instance)) => Some(instance.clone()),
                (false, Err(_)) => None,
            }
        };

        match orphan {
            Some(orphan) => {
                debug!(
                    "Closing {} generation {} created after the slot was closed",
                    self.name, generation
                );
                (self.close)(orphan).await;
                Err(TransportError::Closed)
            }
            None => result,
        }
    }

    /// Best-effort close of an instance that left the slot after a fault.
    fn discard(&self, instance: T, generation: u64) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Closing stale {} generation {}", self.name, generation);
                runtime.spawn((self.close)(instance));
            }
            Err(_) => debug!(
                "No runtime to close stale {} generation {}",
                self.name, generation
            ),
        }
    }

    fn abandon_creation(&self, generation: u64) {
        let mut slot = self.lock_slot();
        if matches!(&*slot, Slot::Creating { generation: g, .. } if *g == generation) {
            *slot = Slot::Empty;
            self.set_state(ResourceState::Unopened);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;

    #[derive(Debug)]
    struct Widget {
        id: usize,
        open: AtomicBool,
    }

    impl Widget {
        fn fault(&self) {
            self.open.store(false, Ordering::Release);
        }
    }

    struct Harness {
        resource: FaultTolerantResource<Arc<Widget>>,
        created: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    fn harness(delay: Duration, fail: bool) -> Harness {
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let resource = {
            let created = created.clone();
            let closed = closed.clone();
            FaultTolerantResource::new(
                "widget",
                move |_timeout, cancel: CancellationToken| {
                    let created = created.clone();
                    async move {
                        let id = created.fetch_add(1, Ordering::SeqCst) + 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        if fail {
                            return Err(TransportError::Network {
                                operation: "widget",
                                message: "refused".to_string(),
                            });
                        }
                        Ok(Arc::new(Widget {
                            id,
                            open: AtomicBool::new(true),
                        }))
                    }
                },
                move |_widget: Arc<Widget>| {
                    let closed = closed.clone();
                    async move {
                        closed.fetch_add(1, Ordering::SeqCst);
                    }
                },
                |widget: &Arc<Widget>| widget.open.load(Ordering::Acquire),
            )
        };
        Harness {
            resource,
            created,
            closed,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_creation() {
        let h = harness(Duration::from_millis(50), false);
        let cancel = CancellationToken::new();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let resource = h.resource.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { resource.get_or_create(TIMEOUT, &cancel).await })
            })
            .collect();

        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await.unwrap().unwrap());
        }

        assert_eq!(h.created.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
        assert_eq!(h.resource.state(), ResourceState::Open);
        assert_eq!(h.resource.generation(), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_failure() {
        let h = harness(Duration::from_millis(50), true);
        let cancel = CancellationToken::new();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resource = h.resource.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { resource.get_or_create(TIMEOUT, &cancel).await })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err.to_string(), "Network error during widget: refused");
        }
        assert_eq!(h.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.resource.state(), ResourceState::Unopened);

        // The slot is empty again, so the next call runs the factory again.
        let _ = h.resource.get_or_create(TIMEOUT, &cancel).await;
        assert_eq!(h.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_try_get_opened_fast_path() {
        let h = harness(Duration::ZERO, false);
        assert!(h.resource.try_get_opened().is_none());

        let created = h
            .resource
            .get_or_create(TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        let fast = h.resource.try_get_opened().unwrap();
        assert!(Arc::ptr_eq(&created, &fast));

        created.fault();
        assert!(h.resource.try_get_opened().is_none());
    }

    #[tokio::test]
    async fn test_faulted_instance_is_recreated() {
        let h = harness(Duration::ZERO, false);
        let cancel = CancellationToken::new();

        let first = h.resource.get_or_create(TIMEOUT, &cancel).await.unwrap();
        first.fault();

        let second = h.resource.get_or_create(TIMEOUT, &cancel).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(h.resource.generation(), Some(2));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_try_remove_only_removes_faulted_instances() {
        let h = harness(Duration::ZERO, false);
        assert!(!h.resource.try_remove());

        let instance = h
            .resource
            .get_or_create(TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!h.resource.try_remove());
        assert!(h.resource.generation().is_some());

        instance.fault();
        assert!(h.resource.try_remove());
        assert!(h.resource.generation().is_none());
        assert_eq!(h.resource.state(), ResourceState::Unopened);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
        assert!(!h.resource.try_remove());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_is_idempotent() {
        let h = harness(Duration::ZERO, false);
        h.resource
            .get_or_create(TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();

        let a = h.resource.clone();
        let b = h.resource.clone();
        let (_, _) = tokio::join!(a.close(), b.close());
        h.resource.close().await;

        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.resource.state(), ResourceState::Closed);
        assert!(h.resource.try_get_opened().is_none());
    }

    #[tokio::test]
    async fn test_close_on_empty_slot_is_noop() {
        let h = harness(Duration::ZERO, false);
        h.resource.close().await;
        assert_eq!(h.closed.load(Ordering::SeqCst), 0);
        assert_eq!(h.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_created_after_close_is_not_leaked() {
        let h = harness(Duration::from_millis(100), false);

        let resource = h.resource.clone();
        let waiter = tokio::spawn(async move {
            resource
                .get_or_create(TIMEOUT, &CancellationToken::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.resource.close().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));

        assert_eq!(h.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
        assert!(h.resource.try_get_opened().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_creation_leaves_slot_empty() {
        let h = harness(Duration::from_secs(60), false);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = h
            .resource
            .get_or_create(Duration::from_secs(120), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.resource.state(), ResourceState::Unopened);
        assert!(h.resource.generation().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_timeout_does_not_abort_creation() {
        let h = harness(Duration::from_secs(2), false);
        let cancel = CancellationToken::new();

        let err = h
            .resource
            .get_or_create(Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { operation: "widget", .. }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.resource.try_get_opened().is_some());
        assert_eq!(h.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_state_is_published() {
        let h = harness(Duration::ZERO, false);
        let rx = h.resource.subscribe_state();
        assert_eq!(*rx.borrow(), ResourceState::Unopened);

        h.resource
            .get_or_create(TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*rx.borrow(), ResourceState::Open);

        h.resource.close().await;
        assert_eq!(*rx.borrow(), ResourceState::Closed);
    }
}
