//! Per-thread views of a backend.
//!
//! A `ThreadView` holds a thread's copy of one backend's state and is only
//! ever touched from that thread, so reads need no locking and the data
//! cannot change between two calls made without returning to the event loop.
//! All property caches for the same target on one thread share one view,
//! which is what makes sibling caches observe identical values even in the
//! middle of a signal cascade.
//!
//! Backend events arrive through an unbounded channel drained by a local
//! task; each event is applied to the view state in full before any signal is
//! re-emitted, and every attached cache sees signal *k* before any of them
//! sees signal *k + 1*.

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::backend::{self, Backend, BackendEvent, BackendRef};
use crate::cache::{CacheEvent, HandleInner};
use crate::error::BusError;
use crate::target::Target;
use crate::value::PropertyMap;

pub(crate) struct ViewState {
    pub properties: PropertyMap,
    pub available: bool,
    pub error: Option<BusError>,
}

/// Apply a full-state replacement and produce the signal sequence, in order:
/// availability flip, error change, map reset, per-property changes
/// (additions and updates, then removals), and finally `Lost`/`Ready`.
fn apply_reset(
    state: &mut ViewState,
    properties: PropertyMap,
    error: Option<BusError>,
) -> Vec<CacheEvent> {
    let available = error.is_none();
    let was_available = state.available;
    let error_changed = state.error.as_ref().map(BusError::kind) != error.as_ref().map(BusError::kind);
    let before = std::mem::replace(&mut state.properties, properties);
    state.available = available;
    state.error = error.clone();

    let mut events = Vec::new();
    if was_available != available {
        events.push(CacheEvent::AvailableChanged(available));
    }
    if error_changed {
        events.push(CacheEvent::ErrorChanged(error));
    }
    if !state.properties.is_empty() || !before.is_empty() {
        events.push(CacheEvent::PropertiesReset(state.properties.clone()));
    }
    for (name, value) in &state.properties {
        if before.get(name) != Some(value) {
            events.push(CacheEvent::PropertyChanged {
                name: name.clone(),
                value: Some(value.clone()),
            });
        }
    }
    for name in before.keys() {
        if !state.properties.contains_key(name) {
            events.push(CacheEvent::PropertyChanged {
                name: name.clone(),
                value: None,
            });
        }
    }
    if was_available && !available {
        events.push(CacheEvent::Lost);
    }
    if !was_available && available {
        events.push(CacheEvent::Ready);
    }
    events
}

/// Merge a delta and produce one `PropertyChanged` per entry. The whole delta
/// is applied before the first signal, so listeners always read post-update
/// values.
fn apply_change(state: &mut ViewState, delta: PropertyMap) -> Vec<CacheEvent> {
    for (name, value) in &delta {
        state.properties.insert(name.clone(), value.clone());
    }
    delta
        .into_iter()
        .map(|(name, value)| CacheEvent::PropertyChanged {
            name,
            value: Some(value),
        })
        .collect()
}

thread_local! {
    static VIEWS: RefCell<HashMap<Target, Weak<ThreadView>>> = RefCell::new(HashMap::new());
}

/// A thread's projection of one backend.
pub(crate) struct ThreadView {
    target: Target,
    backend: BackendRef,
    state: RefCell<ViewState>,
    handles: RefCell<Vec<Weak<HandleInner>>>,
}

impl ThreadView {
    /// The view for `target` on the current thread, creating it (and its
    /// delivery task) on first use. Must run inside a `tokio::task::LocalSet`.
    pub(crate) fn local_instance(target: &Target) -> Rc<ThreadView> {
        VIEWS.with(|views| {
            let mut views = views.borrow_mut();
            if let Some(existing) = views.get(target).and_then(Weak::upgrade) {
                return existing;
            }
            let backend = backend::acquire(target);
            let (snapshot, rx) = backend.subscribe();
            let view = Rc::new(ThreadView {
                target: target.clone(),
                backend,
                state: RefCell::new(ViewState {
                    properties: snapshot.properties,
                    available: snapshot.available,
                    error: snapshot.error,
                }),
                handles: RefCell::new(Vec::new()),
            });
            debug!("created thread view for {target}");
            views.insert(target.clone(), Rc::downgrade(&view));
            spawn_delivery(&view, rx);
            view
        })
    }

    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    pub(crate) fn state(&self) -> Ref<'_, ViewState> {
        self.state.borrow()
    }

    /// Attach an initialized cache; it will receive every re-emitted signal
    /// from now on.
    pub(crate) fn attach(&self, handle: Weak<HandleInner>) {
        self.handles.borrow_mut().push(handle);
    }

    fn deliver(&self, event: BackendEvent) {
        let events = match event {
            BackendEvent::Reset { properties, error } => {
                apply_reset(&mut self.state.borrow_mut(), properties, error)
            }
            BackendEvent::Change { delta } => apply_change(&mut self.state.borrow_mut(), delta),
        };
        self.emit(&events);
    }

    fn emit(&self, events: &[CacheEvent]) {
        for event in events {
            // snapshot so listeners may create or drop caches mid-signal
            let handles = self.handles.borrow().clone();
            for handle in &handles {
                if let Some(handle) = handle.upgrade() {
                    handle.dispatch(event);
                }
            }
        }
        self.handles
            .borrow_mut()
            .retain(|handle| handle.strong_count() > 0);
    }
}

impl Drop for ThreadView {
    fn drop(&mut self) {
        debug!("destroyed thread view for {}", self.target);
        let _ = VIEWS.try_with(|views| {
            let mut views = views.borrow_mut();
            // only remove our own (dead) entry; a replacement view may
            // already be registered
            if let Some(weak) = views.get(&self.target) {
                if weak.strong_count() == 0 {
                    views.remove(&self.target);
                }
            }
        });
    }
}

fn spawn_delivery(view: &Rc<ThreadView>, mut rx: UnboundedReceiver<BackendEvent>) {
    let weak = Rc::downgrade(view);
    tokio::task::spawn_local(async move {
        while let Some(event) = rx.recv().await {
            let Some(view) = weak.upgrade() else {
                break;
            };
            view.deliver(event);
        }
    });
}
