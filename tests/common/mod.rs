//! Shared harness for the integration tests: a local event loop, condition
//! polling, a signal recorder, and the canonical test service layout.
#![allow(dead_code)]

use buscache::transport::mock::MockBus;
use buscache::{CacheEvent, PropertyCache, PropertyMap, Value};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

pub const SERVICE: &str = "test.service";
pub const PATH: &str = "/test/service";
pub const INTERFACE: &str = "test.service";

/// Run a future on a `LocalSet`, the event loop a client thread must provide.
pub async fn local<F: Future>(future: F) -> F::Output {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    tokio::task::LocalSet::new().run_until(future).await
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

/// A mock bus with the test service registered and its object exporting
/// `str = "hello"`.
pub fn service_mock() -> MockBus {
    let mock = MockBus::new();
    mock.register_service(SERVICE);
    let mut props = PropertyMap::new();
    props.insert("str".to_string(), Value::from("hello"));
    mock.add_object(SERVICE, PATH, INTERFACE, props);
    mock
}

/// Collects every signal a cache emits, in order.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<CacheEvent>>>,
}

impl Recorder {
    pub fn attach(cache: &PropertyCache) -> Self {
        let recorder = Self::default();
        let events = recorder.events.clone();
        cache.on_event(move |event| events.borrow_mut().push(event.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    pub fn count(&self, pred: impl Fn(&CacheEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| pred(e)).count()
    }

    pub fn has(&self, pred: impl Fn(&CacheEvent) -> bool) -> bool {
        self.count(pred) > 0
    }

    /// Values carried by `PropertyChanged` signals for `name`, in order.
    pub fn changes_of(&self, name: &str) -> Vec<Option<Value>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                CacheEvent::PropertyChanged { name: n, value } if n == name => {
                    Some(value.clone())
                }
                _ => None,
            })
            .collect()
    }
}
