//! CacheSystem Integration Tests
//!
//! Segment isolation, remote gating, event relay and metrics export

use parking_lot::Mutex;
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strata_cache::metrics::encode_metrics;
use strata_cache::{
    CacheError, CacheEvent, CacheSystem, Environment, MemoryBackend, Operation, Outcome,
    PrometheusObserver, RemoteBackend, SegmentOverride, SetOptions, SystemConfig,
};

type Backends = Arc<Mutex<HashMap<String, Arc<MemoryBackend<i32>>>>>;

/// Production system whose remote levels are per-segment memory backends
fn production_system() -> (CacheSystem<i32>, Backends) {
    let config = SystemConfig {
        environment: Environment::Production,
        ..Default::default()
    };
    let backends: Backends = Arc::new(Mutex::new(HashMap::new()));
    let registry = Arc::clone(&backends);

    let system = CacheSystem::with_remote(config, move |segment| {
        let backend = Arc::new(MemoryBackend::new(format!("memory:{segment}")));
        registry
            .lock()
            .insert(segment.to_string(), Arc::clone(&backend));
        let level: Arc<dyn RemoteBackend<i32>> = backend;
        level
    })
    .unwrap();

    (system, backends)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_segment_isolation() {
    let system: CacheSystem<i32> = CacheSystem::local(SystemConfig::default()).unwrap();

    system
        .set("posts", "k", 1, SetOptions::default())
        .await
        .unwrap();

    assert_eq!(system.get("posts", "k").await.unwrap(), Some(1));
    assert_eq!(system.get("profiles", "k").await.unwrap(), None);
}

#[tokio::test]
async fn test_segment_isolation_with_remote_levels() {
    let (system, backends) = production_system();
    assert_eq!(backends.lock().len(), 5);

    system
        .set("posts", "k", 1, SetOptions::default())
        .await
        .unwrap();
    settle().await;

    assert!(backends.lock()["posts"].contains("k"));
    assert!(!backends.lock()["profiles"].contains("k"));
    assert_eq!(system.get("profiles", "k").await.unwrap(), None);

    system.clear("profiles").await.unwrap();
    assert!(backends.lock()["posts"].contains("k"));
}

#[tokio::test]
async fn test_unknown_segment_fails_fast() {
    let system: CacheSystem<i32> = CacheSystem::local(SystemConfig::default()).unwrap();

    let err = system.delete("leads", "k").await.unwrap_err();
    assert!(matches!(err, CacheError::UnknownSegment(_)));
    assert!(system.invalidate_by_tag("leads", "t").await.is_err());
    assert!(system.segment("leads").is_err());

    let compute = system
        .get_or_compute("leads", "k", || async { Ok(1) }, SetOptions::default())
        .await;
    assert!(compute.is_err());
}

#[tokio::test]
async fn test_configured_segment_is_registered() {
    let mut config = SystemConfig::default();
    config.segments.insert(
        "leads".to_string(),
        SegmentOverride {
            ttl_factor: Some(0.1),
            ..Default::default()
        },
    );
    let system: CacheSystem<i32> = CacheSystem::local(config).unwrap();

    assert!(system.segment_names().contains(&"leads"));
    assert_eq!(
        system.segment_config("leads").unwrap().ttl(),
        Duration::from_secs(30)
    );
    system
        .set("leads", "k", 1, SetOptions::default())
        .await
        .unwrap();
    assert_eq!(system.get("leads", "k").await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = SystemConfig::default();
    config.defaults.max_size = 0;
    let result = CacheSystem::<i32>::local(config);
    assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_clear_all() {
    let (system, backends) = production_system();
    for segment in system.segment_names() {
        system
            .set(segment, "k", 1, SetOptions::default())
            .await
            .unwrap();
    }
    settle().await;

    system.clear_all().await;

    for segment in system.segment_names() {
        assert_eq!(system.get(segment, "k").await.unwrap(), None);
        assert!(backends.lock()[segment].is_empty());
    }
}

#[tokio::test]
async fn test_events_are_annotated() {
    let system: CacheSystem<i32> = CacheSystem::local(SystemConfig::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    system.add_observer(Arc::new(move |event: &CacheEvent| {
        sink.lock().push(event.clone());
    }));
    let mut stream = system.subscribe();

    system
        .set("scans", "k", 1, SetOptions::default())
        .await
        .unwrap();
    system.get("scans", "k").await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    for event in seen.iter() {
        assert_eq!(event.segment.as_deref(), Some("scans"));
        assert_eq!(event.environment, Some(Environment::Development));
    }
    assert_eq!(seen[1].operation, Operation::Get);
    assert_eq!(seen[1].outcome, Outcome::Hit);

    let first = stream.recv().await.unwrap();
    assert_eq!(first.operation, Operation::Set);
    assert_eq!(first.segment.as_deref(), Some("scans"));
}

#[tokio::test]
async fn test_prometheus_export() {
    let system: CacheSystem<i32> = CacheSystem::local(SystemConfig::default()).unwrap();
    let registry = Registry::new();
    system.add_observer(Arc::new(PrometheusObserver::new(&registry).unwrap()));

    system
        .set("posts", "k", 1, SetOptions::default())
        .await
        .unwrap();
    system.get("posts", "k").await.unwrap();
    system.get("posts", "missing").await.unwrap();

    let text = encode_metrics(&registry).unwrap();
    let counted = |outcome: &str| {
        text.lines().any(|line| {
            line.starts_with("strata_cache_operations_total")
                && line.contains(r#"operation="get""#)
                && line.contains(&format!(r#"outcome="{outcome}""#))
                && line.contains(r#"segment="posts""#)
        })
    };
    assert!(counted("hit"));
    assert!(counted("miss"));
}

#[tokio::test]
async fn test_adaptive_ttl_per_segment() {
    let system: CacheSystem<i32> = CacheSystem::local(SystemConfig::default()).unwrap();
    let base = Duration::from_secs(60);

    for _ in 0..20 {
        system.get("posts", "hot").await.unwrap();
        system.get("scans", "hot").await.unwrap();
    }

    // posts adapts, scans has a fixed TTL
    assert!(system.calculate_adaptive_ttl("posts", "hot", base).unwrap() > base);
    assert_eq!(
        system.calculate_adaptive_ttl("scans", "hot", base).unwrap(),
        base
    );
}

#[tokio::test]
async fn test_unreachable_redis_degrades_to_local() {
    let config = SystemConfig {
        environment: Environment::Production,
        remote_url: Some("not a redis url".to_string()),
        ..Default::default()
    };

    let system: CacheSystem = CacheSystem::new(config).await.unwrap();
    for segment in system.segment_names() {
        assert!(!system.segment(segment).unwrap().has_remote());
    }

    system
        .set("posts", "k", serde_json::json!({"id": 1}), SetOptions::default())
        .await
        .unwrap();
    assert_eq!(
        system.get("posts", "k").await.unwrap(),
        Some(serde_json::json!({"id": 1}))
    );
}

#[tokio::test]
async fn test_development_never_connects() {
    let config = SystemConfig {
        remote_url: Some("redis://127.0.0.1:6379".to_string()),
        ..Default::default()
    };

    let system: CacheSystem = CacheSystem::new(config).await.unwrap();
    assert!(!system.segment("posts").unwrap().has_remote());
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_purges_expired_entries() {
    let mut config = SystemConfig::default();
    config.defaults.ttl_ms = 100;
    config.defaults.stale_while_revalidate_ms = 0;
    config.cleanup_interval_ms = 50;
    let system: CacheSystem<i32> = CacheSystem::local(config).unwrap();

    system
        .set("metrics", "k", 1, SetOptions::default())
        .await
        .unwrap();
    system.start_maintenance();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(system.stats()["metrics"].entries, 0);
    assert_eq!(system.stats()["metrics"].expirations, 1);
    system.shutdown().await;
}
