//! Process-wide backends: one authoritative state owner per target.
//!
//! A `Backend` reconciles `GetAll` replies, `PropertiesChanged` signals, and
//! service-owner transitions into a single property map, and broadcasts state
//! events to every subscribed thread view. Backends are shared by all threads
//! and live on the worker thread.
//!
//! When the last view referencing a backend goes away, the backend is not
//! destroyed immediately: it moves to a bounded idle list
//! ([`IDLE_CACHE_CAPACITY`](crate::IDLE_CACHE_CAPACITY) entries, most recent
//! first) so that recreating a cache for the same target shortly afterwards
//! needs no new D-Bus calls. Eviction from the idle list stops the backend's
//! driver task.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::error::{BusError, ErrorKind};
use crate::target::Target;
use crate::transport::BusTransport;
use crate::value::{PropertyMap, Value};
use crate::worker;
use crate::{IDLE_CACHE_CAPACITY, SERVICE_RETRY_DELAY};

/// A state event broadcast from a backend to its thread views.
#[derive(Debug, Clone)]
pub(crate) enum BackendEvent {
    /// Replace the entire state.
    Reset {
        properties: PropertyMap,
        error: Option<BusError>,
    },
    /// Merge a non-empty delta into existing state.
    Change { delta: PropertyMap },
}

/// Copy of a backend's state taken at subscription time.
pub(crate) struct Snapshot {
    pub properties: PropertyMap,
    pub available: bool,
    pub error: Option<BusError>,
}

enum Command {
    Shutdown,
}

#[derive(Default)]
struct Shared {
    properties: PropertyMap,
    available: bool,
    error: Option<BusError>,
    subscribers: Vec<UnboundedSender<BackendEvent>>,
}

/// Authoritative property state for one target.
pub(crate) struct Backend {
    target: Target,
    shared: Mutex<Shared>,
    cmd_tx: UnboundedSender<Command>,
}

impl Backend {
    fn start(target: Target) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            target,
            shared: Mutex::new(Shared::default()),
            cmd_tx,
        });
        debug!("created backend for {}", backend.target);
        worker::handle().spawn(run(backend.clone(), cmd_rx));
        backend
    }

    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    /// Register a view and return a consistent starting snapshot. The
    /// subscription and the snapshot are taken under one lock, so the view
    /// misses no event and sees none twice.
    pub(crate) fn subscribe(&self) -> (Snapshot, UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.lock();
        shared.subscribers.push(tx);
        let snapshot = Snapshot {
            properties: shared.properties.clone(),
            available: shared.available,
            error: shared.error.clone(),
        };
        (snapshot, rx)
    }

    /// Dispatch an asynchronous `Set` call on the worker. Failures are logged
    /// and not surfaced; local state changes only when the service emits
    /// `PropertiesChanged`.
    pub(crate) fn queue_set(&self, property: String, value: Value) {
        let bus = self.target.bus().transport().clone();
        let target = self.target.clone();
        worker::handle().spawn(async move {
            if let Err(err) = bus.set(&target, &property, value).await {
                warn!("failed to set property {property:?} for {target}: {err}");
            }
        });
    }

    /// Ask the driver task to exit.
    fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    fn apply_reset(&self, properties: PropertyMap, error: Option<BusError>) {
        debug_assert!(error.is_none() || properties.is_empty());
        let mut shared = self.lock();
        if !shared.properties.is_empty() || !properties.is_empty() {
            debug!("reset {} with {} properties", self.target, properties.len());
        }
        shared.available = error.is_none();
        shared.properties = properties.clone();
        shared.error = error.clone();
        broadcast(&mut shared, BackendEvent::Reset { properties, error });
    }

    /// Merge a `PropertiesChanged` payload. Returns true when the backend is
    /// unavailable and the caller should trigger a load instead (the payload
    /// is discarded: the reply will carry authoritative values).
    fn merge_changes(&self, changed: PropertyMap) -> bool {
        let mut shared = self.lock();
        if !shared.available {
            return true;
        }
        let mut delta = PropertyMap::new();
        for (name, value) in changed {
            if shared.properties.get(&name) != Some(&value) {
                debug!("change {} {name} = {value}", self.target);
                shared.properties.insert(name.clone(), value.clone());
                delta.insert(name, value);
            }
        }
        if !delta.is_empty() {
            broadcast(&mut shared, BackendEvent::Change { delta });
        }
        false
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn broadcast(shared: &mut Shared, event: BackendEvent) {
    shared
        .subscribers
        .retain(|tx| tx.send(event.clone()).is_ok());
}

type LoadFuture = BoxFuture<'static, Result<PropertyMap, BusError>>;

fn start_load(bus: &Arc<dyn BusTransport>, target: &Target) -> (LoadFuture, Instant) {
    let bus = bus.clone();
    let target = target.clone();
    (
        Box::pin(async move { bus.get_all(&target).await }),
        Instant::now(),
    )
}

/// Driver task: owns all D-Bus activity of one backend and serializes every
/// state transition.
async fn run(backend: Arc<Backend>, mut cmd_rx: UnboundedReceiver<Command>) {
    let target = backend.target.clone();

    if !target.is_valid() {
        warn!("refusing to load properties for {target}");
        backend.apply_reset(
            PropertyMap::new(),
            Some(BusError::new(ErrorKind::InvalidArgs, "invalid target")),
        );
        wait_for_shutdown(&mut cmd_rx).await;
        return;
    }

    let bus = target.bus().transport().clone();
    let mut owner_stream = match bus.owner_changes(target.service()).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to watch the owner of {}: {err}", target.service());
            backend.apply_reset(PropertyMap::new(), Some(err));
            wait_for_shutdown(&mut cmd_rx).await;
            return;
        }
    };
    let mut signal_stream = match bus.properties_changed(&target).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to subscribe to property changes of {target}: {err}");
            backend.apply_reset(PropertyMap::new(), Some(err));
            wait_for_shutdown(&mut cmd_rx).await;
            return;
        }
    };

    let mut pending_load: Option<(LoadFuture, Instant)> = Some(start_load(&bus, &target));
    let mut retry_delay: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Shutdown) | None => break,
            },

            reply = async { pending_load.as_mut().unwrap().0.as_mut().await },
                    if pending_load.is_some() => {
                let started = pending_load.take().map(|(_, started)| started);
                match reply {
                    Ok(properties) => {
                        if let Some(started) = started {
                            debug!(
                                "received properties from {target} in {:?}",
                                started.elapsed()
                            );
                        }
                        backend.apply_reset(properties, None);
                    }
                    Err(err) => {
                        if err.kind() == ErrorKind::ServiceUnknown {
                            info!(
                                "service {} is unavailable, waiting to load properties from {target}",
                                target.service()
                            );
                        } else {
                            warn!("loading properties from {target} failed: {err}");
                        }
                        backend.apply_reset(PropertyMap::new(), Some(err));
                    }
                }
            },

            _ = async { retry_delay.as_mut().unwrap().as_mut().await },
                    if retry_delay.is_some() => {
                retry_delay = None;
                if pending_load.is_none() {
                    pending_load = Some(start_load(&bus, &target));
                }
            },

            change = owner_stream.next() => {
                let Some(change) = change else {
                    debug!("owner watch for {target} ended");
                    break;
                };
                if pending_load.take().is_some() {
                    debug!("service owner changed, canceling pending property load from {target}");
                }
                retry_delay = None;
                match change.new_owner {
                    None => {
                        info!("service disconnected, resetting properties for {target}");
                        backend.apply_reset(
                            PropertyMap::new(),
                            Some(BusError::new(
                                ErrorKind::ServiceUnknown,
                                "service disconnected",
                            )),
                        );
                    }
                    Some(_) => {
                        info!("service is now available, loading properties from {target}");
                        // Give the service a moment to finish starting up so
                        // the first GetAll is likely to succeed. An early
                        // PropertiesChanged forces an immediate load instead.
                        retry_delay = Some(Box::pin(tokio::time::sleep(SERVICE_RETRY_DELAY)));
                    }
                }
            },

            signal = signal_stream.next() => {
                let Some(changed) = signal else {
                    debug!("signal subscription for {target} ended");
                    break;
                };
                if pending_load.is_some() {
                    // Values in the signal will also be in the reply; emitting
                    // them now would break the atomicity guarantees.
                    debug!("ignored property change signal while loading properties from {target}");
                } else if backend.merge_changes(changed) {
                    debug!("retrying load after unexpected PropertiesChanged from {target}");
                    retry_delay = None;
                    pending_load = Some(start_load(&bus, &target));
                }
            },
        }
    }
    debug!("backend for {target} stopped");
}

async fn wait_for_shutdown(cmd_rx: &mut UnboundedReceiver<Command>) {
    loop {
        match cmd_rx.recv().await {
            Some(Command::Shutdown) | None => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry

struct LiveEntry {
    backend: Weak<Backend>,
    handles: usize,
}

#[derive(Default)]
struct Registry {
    live: HashMap<Target, LiveEntry>,
    idle: VecDeque<Arc<Backend>>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Refcounted handle to a live backend. Dropping the last handle for a target
/// releases the backend to the idle list.
pub(crate) struct BackendRef {
    backend: Option<Arc<Backend>>,
}

impl Deref for BackendRef {
    type Target = Backend;

    fn deref(&self) -> &Backend {
        self.backend
            .as_deref()
            .expect("backend released before drop")
    }
}

impl Drop for BackendRef {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            release(backend);
        }
    }
}

/// The unique live backend for a target: an existing live one, one restored
/// from the idle list, or a freshly constructed one. Callable from any thread.
pub(crate) fn acquire(target: &Target) -> BackendRef {
    let mut registry = registry();
    if let Some(entry) = registry.live.get_mut(target) {
        if let Some(backend) = entry.backend.upgrade() {
            entry.handles += 1;
            return BackendRef {
                backend: Some(backend),
            };
        }
        // stale entry from an interrupted release
        registry.live.remove(target);
    }
    if let Some(pos) = registry.idle.iter().position(|b| b.target() == target) {
        if let Some(backend) = registry.idle.remove(pos) {
            debug!("restored backend for {target} from the idle cache");
            registry.live.insert(
                target.clone(),
                LiveEntry {
                    backend: Arc::downgrade(&backend),
                    handles: 1,
                },
            );
            return BackendRef {
                backend: Some(backend),
            };
        }
    }
    let backend = Backend::start(target.clone());
    registry.live.insert(
        target.clone(),
        LiveEntry {
            backend: Arc::downgrade(&backend),
            handles: 1,
        },
    );
    BackendRef {
        backend: Some(backend),
    }
}

fn release(backend: Arc<Backend>) {
    let mut registry = registry();
    let Some(entry) = registry.live.get_mut(backend.target()) else {
        return;
    };
    entry.handles = entry.handles.saturating_sub(1);
    if entry.handles > 0 {
        return;
    }
    let target = backend.target().clone();
    registry.live.remove(&target);
    debug!("released backend for {target} to the idle cache");
    while registry.idle.len() >= IDLE_CACHE_CAPACITY {
        if let Some(evicted) = registry.idle.pop_back() {
            debug!("evicting idle backend for {}", evicted.target());
            evicted.stop();
        }
    }
    registry.idle.push_front(backend);
}

/// Stop and drop every idle backend. Called from [`crate::shutdown`].
pub(crate) fn drain_idle() {
    let mut registry = registry();
    for backend in registry.idle.drain(..) {
        backend.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBus;

    // One test covers the whole acquire/release/idle cycle: the registry is
    // process-global, so splitting this up would let the pieces race.
    #[test]
    fn test_registry_lifecycle() {
        let bus = MockBus::new();
        let target = |path: &str| Target::new(bus.bus(), "test.service", path, "test.iface");

        let a1 = acquire(&target("/a"));
        let ptr = &*a1 as *const Backend;
        let a2 = acquire(&target("/a"));
        assert!(std::ptr::eq(ptr, &*a2));

        // still live while one handle remains
        drop(a2);
        let a3 = acquire(&target("/a"));
        assert!(std::ptr::eq(ptr, &*a3));

        // last drop parks it in the idle list; reacquire restores the same
        // backend without constructing a new one
        drop(a3);
        drop(a1);
        let a4 = acquire(&target("/a"));
        assert!(std::ptr::eq(ptr, &*a4));
        drop(a4);

        // cycling IDLE_CACHE_CAPACITY other targets evicts "/a"
        for i in 0..IDLE_CACHE_CAPACITY {
            let filler = acquire(&target(&format!("/fill/{i}")));
            drop(filler);
        }
        let registry = registry();
        assert!(!registry
            .idle
            .iter()
            .any(|b| b.target() == &target("/a")));
    }
}
