//! Live Redis store tests
//!
//! These exercise the server-side counter scripts against a real Redis.
//! Run with a reachable instance:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo test -p facade-core --test redis_store -- --ignored
//! ```

use facade_core::store::{counter_key, threshold_key};
use facade_core::{MachineId, RedisThresholdStore, ThresholdStore, COUNTER_MAX};
use std::sync::Arc;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn store() -> RedisThresholdStore {
    RedisThresholdStore::connect(&redis_url())
        .await
        .expect("Redis must be reachable at REDIS_URL")
}

/// Machine id not shared with any other run
fn fresh_machine() -> MachineId {
    1_000_000 + rand::random::<u32>() as MachineId
}

async fn cleanup(machine_id: MachineId) {
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = redis::aio::ConnectionManager::new(client).await.unwrap();
    let _: () = redis::cmd("DEL")
        .arg(threshold_key(machine_id))
        .arg(counter_key(machine_id))
        .query_async(&mut conn)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_increment_clamps_at_ceiling() {
    let store = store().await;
    let machine = fresh_machine();
    store.set_threshold(machine, 1.0).await.unwrap();

    let mut last = 0;
    for step in 1..=(COUNTER_MAX + 5) {
        let value = store.increment_counter(machine).await.unwrap();
        assert_eq!(value, step.min(COUNTER_MAX));
        last = value;
    }

    assert_eq!(last, COUNTER_MAX);
    assert_eq!(store.counter(machine).await.unwrap(), COUNTER_MAX);
    cleanup(machine).await;
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_decrement_floors_at_zero() {
    let store = store().await;
    let machine = fresh_machine();

    // Unset counter reads as zero and stays there
    assert_eq!(store.decrement_counter(machine).await.unwrap(), 0);

    store.increment_counter(machine).await.unwrap();
    store.increment_counter(machine).await.unwrap();
    assert_eq!(store.decrement_counter(machine).await.unwrap(), 1);
    assert_eq!(store.decrement_counter(machine).await.unwrap(), 0);
    assert_eq!(store.decrement_counter(machine).await.unwrap(), 0);
    cleanup(machine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore] // Requires Redis running
async fn test_concurrent_increments_never_exceed_ceiling() {
    let store = Arc::new(store().await);
    let machine = fresh_machine();
    store.set_threshold(machine, 1.0).await.unwrap();

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.increment_counter(machine).await.unwrap() })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert!(results.iter().all(|v| (1..=COUNTER_MAX).contains(v)));
    // No lost updates: every step up to the ceiling was taken exactly once
    for step in 1..COUNTER_MAX {
        assert_eq!(results.iter().filter(|v| **v == step).count(), 1, "step {}", step);
    }
    assert_eq!(store.counter(machine).await.unwrap(), COUNTER_MAX);
    cleanup(machine).await;
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_set_threshold_resets_counter() {
    let store = store().await;
    let machine = fresh_machine();

    for _ in 0..7 {
        store.increment_counter(machine).await.unwrap();
    }
    assert_eq!(store.counter(machine).await.unwrap(), 7);

    store.set_threshold(machine, 2.5).await.unwrap();
    assert_eq!(store.get_threshold(machine).await.unwrap(), 2.5);
    assert_eq!(store.counter(machine).await.unwrap(), 0);
    cleanup(machine).await;
}
