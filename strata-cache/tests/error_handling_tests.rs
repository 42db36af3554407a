//! Error Handling Tests
//!
//! Error taxonomy and fail-open behaviour

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strata_cache::{
    CacheError, CacheEvent, CacheStore, ErrorKind, EventBus, Operation, Outcome, SetOptions,
    StoreConfig,
};

#[test]
fn test_error_kinds() {
    assert_eq!(
        CacheError::InvalidConfig("ttl".into()).kind(),
        ErrorKind::Configuration
    );
    assert_eq!(
        CacheError::UnknownSegment("x".into()).kind(),
        ErrorKind::Configuration
    );
    assert_eq!(
        CacheError::Serialization("bad".into()).kind(),
        ErrorKind::Backend
    );
    assert_eq!(
        CacheError::Revalidation("boom".into()).kind(),
        ErrorKind::Revalidation
    );
    assert_eq!(
        CacheError::Invalidation {
            target: "tag 't'".into(),
            failures: vec![],
        }
        .kind(),
        ErrorKind::Invalidation
    );
}

#[test]
fn test_only_hard_errors_are_surfaced() {
    assert!(CacheError::Serialization("bad".into()).is_fail_open());
    assert!(CacheError::Revalidation("boom".into()).is_fail_open());
    assert!(!CacheError::InvalidConfig("ttl".into()).is_fail_open());
    assert!(!CacheError::UnknownSegment("x".into()).is_fail_open());
}

#[test]
fn test_error_messages() {
    let err = CacheError::UnknownSegment("leads".into());
    assert!(err.to_string().contains("leads"));

    let err = CacheError::Invalidation {
        target: "tag 'posts'".into(),
        failures: vec!["a: down".into(), "b: down".into()],
    };
    let message = err.to_string();
    assert!(message.contains("tag 'posts'"));
    assert!(message.contains("a: down; b: down"));
}

#[test]
fn test_serde_error_converts() {
    let err: CacheError = serde_json::from_str::<i32>("nope").unwrap_err().into();
    assert_eq!(err.kind(), ErrorKind::Backend);
}

#[test]
fn test_invalid_store_config() {
    let result = CacheStore::<String, i32>::new(StoreConfig::new(Duration::from_secs(1), 0));
    assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
}

#[test]
fn test_panicking_observer_is_isolated() {
    let events = EventBus::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    events.subscribe(Arc::new(|event: &CacheEvent| {
        if event.operation == Operation::Evict {
            panic!("observer bug");
        }
    }));
    let counter = Arc::clone(&delivered);
    events.subscribe(Arc::new(move |_: &CacheEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let store = CacheStore::with_events(StoreConfig::new(Duration::from_secs(60), 1), events)
        .unwrap();
    store.set("a".to_string(), 1, SetOptions::default());
    store.set("b".to_string(), 2, SetOptions::default());

    // The eviction still happened and reached the healthy observer
    assert_eq!(store.get(&"b".to_string()), Some(2));
    assert_eq!(store.get(&"a".to_string()), None);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_error_keeps_stale_value_and_allows_retry() {
    let events = EventBus::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    events.subscribe(Arc::new(move |event: &CacheEvent| {
        if event.operation == Operation::Revalidate && event.outcome == Outcome::Error {
            counter.fetch_add(1, Ordering::SeqCst);
            sink.lock().extend(event.error.clone());
        }
    }));

    let store = CacheStore::with_events(
        StoreConfig::new(Duration::from_secs(1), 10)
            .with_stale_while_revalidate(Duration::from_secs(10)),
        events,
    )
    .unwrap();
    store.set("k".to_string(), 1, SetOptions::default());
    tokio::time::advance(Duration::from_millis(1500)).await;

    let key = "k".to_string();
    assert_eq!(
        store.get_with_refresh(&key, || async { Err(anyhow::anyhow!("upstream 503")) }),
        Some(1)
    );
    assert_eq!(store.pending_revalidation(&key).unwrap().await, None);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(!store.is_revalidating(&key));
    {
        let messages = messages.lock();
        assert!(messages[0].starts_with("Revalidation failed: key k"));
        assert!(messages[0].contains("upstream 503"));
    }

    // Still stale, a later read may retry
    assert_eq!(
        store.get_with_refresh(&key, || async { Ok(2) }),
        Some(1)
    );
    assert_eq!(store.pending_revalidation(&key).unwrap().await, Some(2));
    assert_eq!(store.stats().revalidation_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_refresh_is_contained() {
    let store = CacheStore::new(
        StoreConfig::new(Duration::from_secs(1), 10)
            .with_stale_while_revalidate(Duration::from_secs(10)),
    )
    .unwrap();
    store.set("k".to_string(), 1, SetOptions::default());
    tokio::time::advance(Duration::from_millis(1500)).await;

    let key = "k".to_string();
    let should_panic = true;
    store.get_with_refresh(&key, move || async move {
        if should_panic {
            panic!("refresh bug");
        }
        Ok(2)
    });

    assert_eq!(store.pending_revalidation(&key).unwrap().await, None);
    assert_eq!(store.get(&key), Some(1));
}
