//! Distributed rate limiting across independent contexts sharing one store.

use std::time::Duration;

use convoy::{EngineConfig, EngineError, ExecutionContext};
use tempfile::TempDir;

fn context(store: &std::path::Path, root: &std::path::Path) -> ExecutionContext {
    let config = EngineConfig::default()
        .with_max_concurrent(1)
        .with_queue_timeout(Duration::from_secs(1))
        .with_store_path(store);
    ExecutionContext::new(config, root).expect("context")
}

#[tokio::test]
async fn test_contexts_sharing_a_store_share_slots() {
    let dir = TempDir::new().expect("temp dir");
    let store = dir.path().join("limiter.db");
    let first = context(&store, dir.path());
    let second = context(&store, dir.path());
    assert!(!first.limiter().is_degraded());

    let lease = tokio_test::assert_ok!(first.limiter().acquire("worker-1").await);
    assert!(!lease.is_local());

    let blocked = second.limiter().acquire("worker-2").await;
    assert!(matches!(blocked, Err(EngineError::AcquireTimeout { .. })));

    first.limiter().release(lease).await;
    let value = second
        .with_resource_slot("worker-2", async { Ok::<_, EngineError>(42) })
        .await
        .expect("slot after release");
    assert_eq!(value, 42);
    assert_eq!(first.limiter().in_use().await, 0);
}
