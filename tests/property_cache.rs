//! End-to-end behavior of `PropertyCache` against the in-process transport:
//! initialization ordering, availability transitions, change filtering,
//! atomicity, data sharing, and the `set` path.

mod common;

use buscache::transport::mock::MockBus;
use buscache::{adaptor, CacheEvent, ErrorKind, PropertyCache, PropertyMap, Target, Value};
use common::{local, service_mock, wait_until, Recorder, INTERFACE, PATH, SERVICE};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn target(mock: &MockBus) -> Target {
    Target::new(mock.bus(), SERVICE, PATH, INTERFACE)
}

fn ready_sequence(properties: PropertyMap) -> Vec<CacheEvent> {
    let mut events = vec![
        CacheEvent::AvailableChanged(true),
        CacheEvent::PropertiesReset(properties.clone()),
    ];
    for (name, value) in &properties {
        events.push(CacheEvent::PropertyChanged {
            name: name.clone(),
            value: Some(value.clone()),
        });
    }
    events.push(CacheEvent::Ready);
    events
}

#[tokio::test]
async fn test_service_absent_reports_error() {
    local(async {
        let mock = MockBus::new();
        let cache = PropertyCache::new(target(&mock));
        let recorder = Recorder::attach(&cache);

        assert!(!cache.is_available());
        assert!(cache.error().is_none());

        wait_until(|| cache.error().is_some()).await;
        assert_eq!(cache.error().unwrap().kind(), ErrorKind::ServiceUnknown);
        assert!(!cache.is_available());

        // only the error is announced: no availability flip, no reset, no
        // ready, no lost
        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CacheEvent::ErrorChanged(Some(_))));
    })
    .await;
}

#[tokio::test]
async fn test_service_appears_then_vanishes() {
    local(async {
        let mock = service_mock();
        let cache = PropertyCache::new(target(&mock));
        let recorder = Recorder::attach(&cache);

        // values must already be readable inside the very first signal
        let reader = cache.clone();
        cache.on_event(move |event| {
            if let CacheEvent::AvailableChanged(true) = event {
                assert_eq!(reader.get_as::<String>("str"), "hello");
            }
        });

        wait_until(|| cache.is_available()).await;
        let mut expected = PropertyMap::new();
        expected.insert("str".to_string(), Value::from("hello"));
        assert_eq!(recorder.events(), ready_sequence(expected));
        recorder.clear();

        // the service goes away: everything clears, in order
        mock.unregister_service(SERVICE);
        wait_until(|| recorder.has(|e| matches!(e, CacheEvent::Lost))).await;
        let events = recorder.events();
        assert!(matches!(events[0], CacheEvent::AvailableChanged(false)));
        match &events[1] {
            CacheEvent::ErrorChanged(Some(err)) => {
                assert_eq!(err.kind(), ErrorKind::ServiceUnknown)
            }
            other => panic!("expected ErrorChanged, got {other:?}"),
        }
        assert_eq!(events[2], CacheEvent::PropertiesReset(PropertyMap::new()));
        assert_eq!(
            events[3],
            CacheEvent::PropertyChanged {
                name: "str".to_string(),
                value: None,
            }
        );
        assert_eq!(events[4], CacheEvent::Lost);
        assert_eq!(events.len(), 5);
        assert!(!cache.is_available());
        assert!(cache.get_all().is_empty());
        recorder.clear();

        // and comes back: the owner watch schedules a reload
        mock.register_service(SERVICE);
        wait_until(|| cache.is_available()).await;
        assert_eq!(cache.get_as::<String>("str"), "hello");
        assert!(recorder.has(|e| matches!(e, CacheEvent::Ready)));
    })
    .await;
}

#[tokio::test]
async fn test_redundant_updates_are_filtered() {
    local(async {
        let mock = service_mock();
        let cache = PropertyCache::new(target(&mock));
        wait_until(|| cache.is_available()).await;
        let recorder = Recorder::attach(&cache);

        // three service-side writes, one redundant
        mock.set_property(SERVICE, PATH, INTERFACE, "str", "one");
        mock.set_property(SERVICE, PATH, INTERFACE, "str", "one");
        mock.set_property(SERVICE, PATH, INTERFACE, "str", "two");

        wait_until(|| cache.get_as::<String>("str") == "two").await;
        assert_eq!(
            recorder.changes_of("str"),
            vec![Some(Value::from("one")), Some(Value::from("two"))]
        );
    })
    .await;
}

#[tokio::test]
async fn test_multi_property_change_is_atomic() {
    local(async {
        let mock = service_mock();
        let cache = PropertyCache::new(target(&mock));
        wait_until(|| cache.is_available()).await;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let reader = cache.clone();
        let names = seen.clone();
        cache.on_event(move |event| {
            if let CacheEvent::PropertyChanged { name, .. } = event {
                // both changes apply before either signal
                assert_eq!(reader.get("variant"), Some(Value::I32(999)));
                assert_eq!(reader.get_as::<String>("str"), "test");
                names.borrow_mut().push(name.clone());
            }
        });

        let mut changed = PropertyMap::new();
        changed.insert("variant".to_string(), Value::I32(999));
        changed.insert("str".to_string(), Value::from("test"));
        mock.set_properties(SERVICE, PATH, INTERFACE, changed);

        wait_until(|| seen.borrow().len() == 2).await;
        assert_eq!(*seen.borrow(), vec!["str".to_string(), "variant".to_string()]);
    })
    .await;
}

#[tokio::test]
async fn test_sibling_caches_agree_during_signals() {
    local(async {
        let mock = service_mock();
        let cache0 = PropertyCache::new(target(&mock));
        wait_until(|| cache0.is_available()).await;

        let cache1 = PropertyCache::new(target(&mock));
        assert!(cache1.initialize());
        assert!(cache1.is_available());

        let count = Rc::new(Cell::new(0u32));
        for cache in [&cache0, &cache1] {
            let (a, b) = (cache0.clone(), cache1.clone());
            let count = count.clone();
            cache.on_event(move |event| {
                if let CacheEvent::PropertyChanged { .. } = event {
                    assert_eq!(a.get_as::<String>("str"), "test");
                    assert_eq!(b.get_as::<String>("str"), "test");
                    count.set(count.get() + 1);
                }
            });
        }

        mock.set_property(SERVICE, PATH, INTERFACE, "str", "test");
        wait_until(|| count.get() == 2).await;
    })
    .await;
}

#[tokio::test]
async fn test_shared_backend_initializes_immediately() {
    local(async {
        let mock = service_mock();
        let cache_a = PropertyCache::new(target(&mock));
        wait_until(|| cache_a.is_available()).await;

        // a fresh cache starts uninitialized even though shared data exists
        let cache_b = PropertyCache::new(target(&mock));
        assert!(!cache_b.is_available());
        assert!(cache_b.get_all().is_empty());
        assert!(!cache_b.contains("str"));
        assert!(cache_b.get("str").is_none());

        // explicit initialize replays everything inline
        let recorder = Recorder::attach(&cache_b);
        assert!(cache_b.initialize());
        let mut expected = PropertyMap::new();
        expected.insert("str".to_string(), Value::from("hello"));
        assert_eq!(recorder.events(), ready_sequence(expected));
        assert!(cache_b.is_available());

        // without an explicit call, the deferred initialization catches up
        let cache_c = PropertyCache::new(target(&mock));
        assert!(!cache_c.is_available());
        wait_until(|| cache_c.is_available()).await;

        // the data was fetched from the service exactly once
        assert_eq!(mock.get_all_calls(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_shared_backend_across_threads() {
    local(async {
        let mock = service_mock();
        let cache_a = PropertyCache::new(target(&mock));
        wait_until(|| cache_a.is_available()).await;

        let thread_target = target(&mock);
        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let set = tokio::task::LocalSet::new();
            rt.block_on(set.run_until(async move {
                let cache = PropertyCache::new(thread_target);
                assert!(!cache.is_available());
                // the other thread's backend already holds the data
                assert!(cache.initialize());
                assert!(cache.is_available());
                assert_eq!(cache.get_as::<String>("str"), "hello");
            }));
        });
        handle.join().unwrap();

        assert_eq!(mock.get_all_calls(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_error_state_is_shared() {
    local(async {
        let mock = MockBus::new();
        let cache0 = PropertyCache::new(target(&mock));
        wait_until(|| cache0.error().is_some()).await;

        let cache1 = PropertyCache::new(target(&mock));
        assert!(cache1.error().is_none());
        let recorder = Recorder::attach(&cache1);
        assert!(cache1.initialize());
        assert_eq!(
            recorder.count(|e| matches!(e, CacheEvent::ErrorChanged(_))),
            1
        );
        assert_eq!(cache1.error().unwrap().kind(), cache0.error().unwrap().kind());
    })
    .await;
}

#[tokio::test]
async fn test_destroy_quickly_is_safe() {
    local(async {
        let mock = service_mock();
        {
            let cache = PropertyCache::new(target(&mock));
            drop(cache);
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // again with shared data present, so the deferred initialization
        // task finds its cache gone
        let keeper = PropertyCache::new(target(&mock));
        wait_until(|| keeper.is_available()).await;
        {
            let cache = PropertyCache::new(target(&mock));
            drop(cache);
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    })
    .await;
}

#[tokio::test]
async fn test_unexpected_properties_changed_triggers_reload() {
    local(async {
        let mock = MockBus::new();
        // the name is owned but the object is not registered yet
        mock.register_service(SERVICE);

        let cache = PropertyCache::new(target(&mock));
        let recorder = Recorder::attach(&cache);
        wait_until(|| cache.error().map(|e| e.kind()) == Some(ErrorKind::UnknownObject)).await;

        // the object appears silently; a stray signal reaches the cache that
        // still believes the object is missing
        let mut props = PropertyMap::new();
        props.insert("str".to_string(), Value::from("hello"));
        mock.add_object(SERVICE, PATH, INTERFACE, props);
        let mut stray = PropertyMap::new();
        stray.insert("unexpected".to_string(), Value::Bool(true));
        adaptor::emit_properties_changed(&mock.bus(), PATH, INTERFACE, stray)
            .await
            .unwrap();

        // the stray signal forces a reload, which now succeeds
        wait_until(|| cache.is_available()).await;

        // the stray payload itself was never cached
        assert!(!cache.contains("unexpected"));
        for value in recorder.changes_of("unexpected") {
            panic!("unexpected property leaked into the cache: {value:?}");
        }
        assert_eq!(
            recorder.count(|e| matches!(e, CacheEvent::PropertyChanged { .. })),
            cache.get_all().len()
        );
    })
    .await;
}

#[tokio::test]
async fn test_set_round_trips_through_the_service() {
    local(async {
        let mock = service_mock();
        let cache = PropertyCache::new(target(&mock));
        wait_until(|| cache.is_available()).await;

        // a failing set is logged and otherwise ignored
        cache.set("invalid", "invalid");

        // a successful set only shows up via the service's signal
        cache.set("str", "I did it");
        wait_until(|| cache.get_as::<String>("str") == "I did it").await;
        assert!(!cache.contains("invalid"));
    })
    .await;
}

#[tokio::test]
async fn test_invalid_target_refuses_to_load() {
    local(async {
        let mock = MockBus::new();
        let cache = PropertyCache::new(Target::new(mock.bus(), "", PATH, INTERFACE));
        wait_until(|| cache.error().is_some()).await;
        assert_eq!(cache.error().unwrap().kind(), ErrorKind::InvalidArgs);
        assert!(!cache.is_available());
        // no GetAll was ever dispatched
        assert_eq!(mock.get_all_calls(), 0);
    })
    .await;
}
