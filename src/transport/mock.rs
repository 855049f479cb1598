//! In-process transport for tests.
//!
//! `MockBus` simulates the bus-side behavior the cache depends on: service
//! name ownership, objects with property maps, `PropertiesChanged` signal
//! routing, and the property method calls. Tests drive the service side
//! directly (register/unregister services, mutate properties) and observe the
//! cache reacting exactly as it would against a real bus.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{BusTransport, OwnerChange, OwnerStream, SignalStream};
use crate::error::{BusError, ErrorKind};
use crate::target::{Bus, Target};
use crate::value::{PropertyMap, Value};

/// (service, path, interface) key of a registered object.
type ObjectKey = (String, String, String);

/// (path, interface) key of a signal subscription.
type SignalKey = (String, String);

#[derive(Debug, Default)]
struct State {
    owners: HashMap<String, String>,
    next_owner: u64,
    objects: HashMap<ObjectKey, PropertyMap>,
    owner_watchers: Vec<(String, UnboundedSender<OwnerChange>)>,
    signal_watchers: Vec<(SignalKey, UnboundedSender<PropertyMap>)>,
    get_all_calls: u64,
    get_all_delay: Option<std::time::Duration>,
}

/// An in-process bus with service-side controls.
///
/// Cloning shares the same bus; [`MockBus::bus`] wraps it into a [`Bus`]
/// handle for building targets. Every `MockBus` has a unique identity, so
/// targets on different mock buses never share backends.
#[derive(Debug, Clone)]
pub struct MockBus {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: String,
    state: Mutex<State>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = format!("mock-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// A [`Bus`] handle over this mock, for constructing targets.
    pub fn bus(&self) -> Bus {
        Bus::new(Arc::new(self.clone()))
    }

    /// Give `service` an owner, notifying owner watchers.
    pub fn register_service(&self, service: &str) {
        let mut state = self.lock();
        state.next_owner += 1;
        let owner = format!(":1.{}", state.next_owner);
        state.owners.insert(service.to_string(), owner.clone());
        notify_owner(&mut state, service, Some(owner));
    }

    /// Drop `service`'s owner, notifying owner watchers.
    pub fn unregister_service(&self, service: &str) {
        let mut state = self.lock();
        state.owners.remove(service);
        notify_owner(&mut state, service, None);
    }

    /// Register an object with its property map. Does not emit any signal.
    pub fn add_object(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        properties: PropertyMap,
    ) {
        self.lock().objects.insert(
            (service.to_string(), path.to_string(), interface.to_string()),
            properties,
        );
    }

    /// Remove an object. Does not emit any signal.
    pub fn remove_object(&self, service: &str, path: &str, interface: &str) {
        self.lock().objects.remove(&(
            service.to_string(),
            path.to_string(),
            interface.to_string(),
        ));
    }

    /// Service-side property write: update the object and emit a
    /// `PropertiesChanged` signal for the single property. The signal is
    /// emitted even when the value is unchanged, as a typical service setter
    /// would.
    pub fn set_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        name: &str,
        value: impl Into<Value>,
    ) {
        let mut changed = PropertyMap::new();
        changed.insert(name.to_string(), value.into());
        self.set_properties(service, path, interface, changed);
    }

    /// Service-side multi-property write: apply all entries, then emit one
    /// `PropertiesChanged` signal carrying the whole map.
    pub fn set_properties(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        changed: PropertyMap,
    ) {
        let mut state = self.lock();
        let key = (service.to_string(), path.to_string(), interface.to_string());
        if let Some(object) = state.objects.get_mut(&key) {
            for (name, value) in &changed {
                object.insert(name.clone(), value.clone());
            }
        }
        notify_signal(&mut state, path, interface, changed);
    }

    /// Number of `GetAll` calls answered (including failures).
    pub fn get_all_calls(&self) -> u64 {
        self.lock().get_all_calls
    }

    /// Delay every `GetAll` reply, simulating bus latency. Lets tests observe
    /// the still-loading state deterministically.
    pub fn set_get_all_delay(&self, delay: std::time::Duration) {
        self.lock().get_all_delay = Some(delay);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn notify_owner(state: &mut State, service: &str, new_owner: Option<String>) {
    state.owner_watchers.retain(|(watched, tx)| {
        if watched != service {
            return !tx.is_closed();
        }
        tx.send(OwnerChange {
            new_owner: new_owner.clone(),
        })
        .is_ok()
    });
}

fn notify_signal(state: &mut State, path: &str, interface: &str, changed: PropertyMap) {
    state.signal_watchers.retain(|((p, i), tx)| {
        if p != path || i != interface {
            return !tx.is_closed();
        }
        tx.send(changed.clone()).is_ok()
    });
}

fn channel_stream<T: Send + 'static>(rx: UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

#[async_trait]
impl BusTransport for MockBus {
    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn get_all(&self, target: &Target) -> Result<PropertyMap, BusError> {
        let delay = self.lock().get_all_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.get_all_calls += 1;
        if !state.owners.contains_key(target.service()) {
            return Err(BusError::new(
                ErrorKind::ServiceUnknown,
                format!("the name {} has no owner", target.service()),
            ));
        }
        let key = (
            target.service().to_string(),
            target.path().to_string(),
            target.interface().to_string(),
        );
        match state.objects.get(&key) {
            Some(properties) => Ok(properties.clone()),
            None => Err(BusError::new(
                ErrorKind::UnknownObject,
                format!("no object at {}", target.path()),
            )),
        }
    }

    async fn set(&self, target: &Target, property: &str, value: Value) -> Result<(), BusError> {
        let mut state = self.lock();
        if !state.owners.contains_key(target.service()) {
            return Err(BusError::new(
                ErrorKind::ServiceUnknown,
                format!("the name {} has no owner", target.service()),
            ));
        }
        let key = (
            target.service().to_string(),
            target.path().to_string(),
            target.interface().to_string(),
        );
        let Some(object) = state.objects.get_mut(&key) else {
            return Err(BusError::new(
                ErrorKind::UnknownObject,
                format!("no object at {}", target.path()),
            ));
        };
        if !object.contains_key(property) {
            return Err(BusError::new(
                ErrorKind::InvalidArgs,
                format!("no such property {property:?}"),
            ));
        }
        let value = match value {
            Value::Variant(inner) => *inner,
            other => other,
        };
        object.insert(property.to_string(), value.clone());
        let mut changed = PropertyMap::new();
        changed.insert(property.to_string(), value);
        notify_signal(&mut state, target.path(), target.interface(), changed);
        Ok(())
    }

    async fn properties_changed(&self, target: &Target) -> Result<SignalStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().signal_watchers.push((
            (target.path().to_string(), target.interface().to_string()),
            tx,
        ));
        Ok(channel_stream(rx))
    }

    async fn owner_changes(&self, service: &str) -> Result<OwnerStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().owner_watchers.push((service.to_string(), tx));
        Ok(channel_stream(rx))
    }

    async fn emit_properties_changed(
        &self,
        path: &str,
        interface: &str,
        changed: PropertyMap,
    ) -> Result<(), BusError> {
        notify_signal(&mut self.lock(), path, interface, changed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(bus: &MockBus) -> Target {
        Target::new(bus.bus(), "test.service", "/test/service", "test.service")
    }

    #[tokio::test]
    async fn test_get_all_requires_service_and_object() {
        let bus = MockBus::new();
        let target = target(&bus);

        let err = bus.get_all(&target).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnknown);

        bus.register_service("test.service");
        let err = bus.get_all(&target).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownObject);

        let mut props = PropertyMap::new();
        props.insert("str".into(), Value::from("hello"));
        bus.add_object("test.service", "/test/service", "test.service", props.clone());
        assert_eq!(bus.get_all(&target).await.unwrap(), props);
        assert_eq!(bus.get_all_calls(), 3);
    }

    #[tokio::test]
    async fn test_set_unknown_property_fails() {
        let bus = MockBus::new();
        let target = target(&bus);
        bus.register_service("test.service");
        bus.add_object("test.service", "/test/service", "test.service", PropertyMap::new());

        let err = bus
            .set(&target, "missing", Value::from("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs);
    }

    #[tokio::test]
    async fn test_signals_reach_subscribers() {
        let bus = MockBus::new();
        let target = target(&bus);
        bus.register_service("test.service");
        bus.add_object("test.service", "/test/service", "test.service", PropertyMap::new());

        let mut stream = bus.properties_changed(&target).await.unwrap();
        bus.set_property("test.service", "/test/service", "test.service", "str", "one");
        let changed = stream.next().await.unwrap();
        assert_eq!(changed.get("str"), Some(&Value::from("one")));
    }

    #[tokio::test]
    async fn test_owner_watch() {
        let bus = MockBus::new();
        let mut stream = bus.owner_changes("test.service").await.unwrap();
        bus.register_service("test.service");
        assert!(stream.next().await.unwrap().new_owner.is_some());
        bus.unregister_service("test.service");
        assert!(stream.next().await.unwrap().new_owner.is_none());
    }
}
