//! The user-facing property cache.
//!
//! `PropertyCache` is a fully asynchronous view of one remote interface's
//! properties:
//!
//! - properties load automatically and reset when the service (dis)connects
//! - `PropertiesChanged` signals update the cached values
//! - instances with the same target share data across the whole process
//! - no call ever blocks on D-Bus
//!
//! # Initialization
//!
//! Data loads asynchronously, so a newly constructed cache is always
//! initially empty and unavailable, even when shared data already exists:
//! this gives the caller a chance to register [`on_event`] listeners and see
//! consistent behavior in every case. Signals arrive once the thread returns
//! to its event loop, or immediately after an explicit [`initialize`] call.
//!
//! When data becomes available the cache updates all values internally, then
//! emits `AvailableChanged(true)`, `PropertiesReset`, one `PropertyChanged`
//! per property, and finally `Ready`. When data becomes unavailable it clears
//! all values, then emits `AvailableChanged(false)`, `ErrorChanged`,
//! `PropertiesReset` with an empty map, one `PropertyChanged` per cleared
//! property, and finally `Lost`. In the middle of any such cascade, [`get`]
//! already returns the post-update state: the cache is never partially
//! initialized.
//!
//! # Threading
//!
//! A cache is bound to the thread that created it and is `!Send`; every cache
//! for the same target on one thread shares one underlying view, so sibling
//! caches always agree, even during signal emission. The thread must run a
//! current-thread tokio runtime with a [`tokio::task::LocalSet`]; delivery is
//! scheduled there.
//!
//! [`on_event`]: PropertyCache::on_event
//! [`initialize`]: PropertyCache::initialize
//! [`get`]: PropertyCache::get

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

use crate::error::BusError;
use crate::target::{Bus, Target};
use crate::value::{FromValue, PropertyMap, Value};
use crate::view::ThreadView;

/// A notification re-emitted by a [`PropertyCache`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// Availability flipped. Emitted before any property signal of the same
    /// transition.
    AvailableChanged(bool),
    /// The error kind changed; `None` means a previous error cleared.
    ErrorChanged(Option<BusError>),
    /// The whole property map was replaced.
    PropertiesReset(PropertyMap),
    /// One property changed; `None` means the property no longer has a value.
    PropertyChanged { name: String, value: Option<Value> },
    /// Data became unavailable. Always the last signal of its cascade.
    Lost,
    /// All properties are loaded. Always the last signal of its cascade.
    Ready,
}

type Listener = Box<dyn FnMut(&CacheEvent)>;

pub(crate) struct HandleInner {
    view: Rc<ThreadView>,
    initialized: Cell<bool>,
    listeners: RefCell<Vec<Listener>>,
}

impl HandleInner {
    fn initialize(this: &Rc<Self>) -> bool {
        let (available, error, properties) = {
            let state = this.view.state();
            (
                state.available,
                state.error.clone(),
                state.properties.clone(),
            )
        };
        if this.initialized.get() {
            return available || error.is_some();
        }
        this.view.attach(Rc::downgrade(this));
        this.initialized.set(true);

        if error.is_some() {
            this.dispatch(&CacheEvent::ErrorChanged(error));
            return true;
        }
        if !available {
            return false;
        }

        // replay in the same order a reset would use
        this.dispatch(&CacheEvent::AvailableChanged(true));
        this.dispatch(&CacheEvent::PropertiesReset(properties.clone()));
        for (name, value) in &properties {
            this.dispatch(&CacheEvent::PropertyChanged {
                name: name.clone(),
                value: Some(value.clone()),
            });
        }
        this.dispatch(&CacheEvent::Ready);
        true
    }

    /// Run every listener. Listeners may read sibling caches or register
    /// further listeners; registrations during dispatch take effect from the
    /// next signal.
    pub(crate) fn dispatch(&self, event: &CacheEvent) {
        let mut listeners = self.listeners.take();
        for listener in listeners.iter_mut() {
            listener(event);
        }
        let mut slot = self.listeners.borrow_mut();
        let added = std::mem::take(&mut *slot);
        *slot = listeners;
        slot.extend(added);
    }
}

/// Asynchronous, shared, never-blocking access to the properties of one
/// remote D-Bus interface. See the [module docs](self) for the signal and
/// consistency guarantees.
///
/// Cloning is cheap and yields a handle to the *same* cache (shared
/// initialization state and listeners); construct a new `PropertyCache` for
/// an independently initialized instance.
#[derive(Clone)]
pub struct PropertyCache {
    inner: Rc<HandleInner>,
}

impl PropertyCache {
    /// Cache the properties of `target`.
    ///
    /// If shared data for the target already exists in this process, no D-Bus
    /// call is made; the cache still reports unavailable until the deferred
    /// initialization runs (or [`initialize`](Self::initialize) is called).
    pub fn new(target: Target) -> Self {
        let view = ThreadView::local_instance(&target);
        let inner = Rc::new(HandleInner {
            view,
            initialized: Cell::new(false),
            listeners: RefCell::new(Vec::new()),
        });
        debug!("created property cache for {target}");

        let has_state = {
            let state = inner.view.state();
            state.available || state.error.is_some()
        };
        if has_state {
            // defer so the caller can register listeners first; a no-op if
            // the cache is dropped before the task runs
            let weak = Rc::downgrade(&inner);
            tokio::task::spawn_local(async move {
                if let Some(inner) = weak.upgrade() {
                    HandleInner::initialize(&inner);
                }
            });
        } else {
            // nothing to replay yet; just hook up the signals
            HandleInner::initialize(&inner);
        }
        Self { inner }
    }

    /// Cache `interface` at `path` of `service` on the session bus.
    pub fn with_session(
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self::new(Target::session(service, path, interface))
    }

    /// Cache `interface` at `path` of `service` on an explicit bus.
    pub fn with_bus(
        bus: Bus,
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        Self::new(Target::new(bus, service, path, interface))
    }

    pub fn target(&self) -> &Target {
        self.inner.view.target()
    }

    pub fn bus(&self) -> &Bus {
        self.target().bus()
    }

    /// Register a listener for every signal this cache emits.
    pub fn on_event(&self, listener: impl FnMut(&CacheEvent) + 'static) {
        self.inner.listeners.borrow_mut().push(Box::new(listener));
    }

    /// Initialize immediately instead of waiting for the event loop.
    ///
    /// If shared data (or a shared error) already exists, the corresponding
    /// signals are emitted inline, before this returns, and the return value
    /// is `true`. If a load is still pending, nothing happens and the return
    /// value is `false`; the signals arrive once the load completes.
    ///
    /// Call this after registering listeners.
    pub fn initialize(&self) -> bool {
        HandleInner::initialize(&self.inner)
    }

    /// Whether all properties currently have values. `false` until
    /// initialization, while the service is offline, and after any error.
    pub fn is_available(&self) -> bool {
        self.inner.initialized.get() && self.inner.view.state().available
    }

    /// The last error observed, if data is unavailable because of one.
    pub fn error(&self) -> Option<BusError> {
        if !self.inner.initialized.get() {
            return None;
        }
        self.inner.view.state().error.clone()
    }

    /// The cached value of `property`, or `None` if the property does not
    /// exist or data is not available.
    pub fn get(&self, property: &str) -> Option<Value> {
        if !self.inner.initialized.get() {
            return None;
        }
        self.inner.view.state().properties.get(property).cloned()
    }

    /// The cached value of `property` converted to `T`, or `T::default()` if
    /// the property is missing or has an incompatible type.
    pub fn get_as<T: FromValue + Default>(&self, property: &str) -> T {
        self.get(property)
            .and_then(|value| T::from_value(&value))
            .unwrap_or_default()
    }

    pub fn contains(&self, property: &str) -> bool {
        self.inner.initialized.get() && self.inner.view.state().properties.contains_key(property)
    }

    /// All cached properties. Empty until initialization or while
    /// unavailable.
    pub fn get_all(&self) -> PropertyMap {
        if !self.inner.initialized.get() {
            return PropertyMap::new();
        }
        self.inner.view.state().properties.clone()
    }

    /// Ask the service to change a property.
    ///
    /// The request is dispatched asynchronously and the cached value does
    /// *not* change now: it updates only when (and if) the service emits
    /// `PropertiesChanged`. A failed request is logged at warning level and
    /// not otherwise reported.
    pub fn set(&self, property: &str, value: impl Into<Value>) {
        self.inner
            .view
            .backend()
            .queue_set(property.to_string(), value.into());
    }
}
