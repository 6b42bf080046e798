// tests/unit_leader_test.rs

mod common;

use prismctl::config::LockConfig;
use prismctl::core::leader::{LeaderAgent, LeaderFlag, LockStore, MemoryLockStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn lock_config(ttl: i64) -> LockConfig {
    LockConfig {
        key: "/test/leader".to_string(),
        lease_ttl: ttl,
        ..LockConfig::default()
    }
}

#[tokio::test]
async fn test_acquire_once_is_exclusive() {
    let store = MemoryLockStore::new();
    let lease_a = store.lease_grant(5).await.unwrap();
    let lease_b = store.lease_grant(5).await.unwrap();

    assert!(store.acquire_once("/k", "a", lease_a).await.unwrap());
    assert!(!store.acquire_once("/k", "b", lease_b).await.unwrap());

    let (value, _) = store.get_with_revision("/k").await.unwrap().unwrap();
    assert_eq!(value, "a");
}

#[tokio::test]
async fn test_safe_put_cas_on_mod_revision() {
    let store = MemoryLockStore::new();
    let lease = store.lease_grant(5).await.unwrap();
    store.acquire_once("/k", "a", lease).await.unwrap();
    let (_, revision) = store.get_with_revision("/k").await.unwrap().unwrap();

    assert!(store.safe_put("/k", "b", revision).await.unwrap());
    // The revision moved; the stale CAS loses.
    assert!(!store.safe_put("/k", "c", revision).await.unwrap());
    let (value, _) = store.get_with_revision("/k").await.unwrap().unwrap();
    assert_eq!(value, "b");
}

#[tokio::test]
async fn test_lease_expiry_releases_the_key() {
    let store = MemoryLockStore::new();
    let lease = store.lease_grant(5).await.unwrap();
    store.acquire_once("/k", "a", lease).await.unwrap();

    store.expire_lease(lease);
    assert!(store.get_with_revision("/k").await.unwrap().is_none());
    assert_eq!(store.lease_keep_alive(lease).await.unwrap(), 0);
}

#[tokio::test]
async fn test_leader_failover_hands_off_within_a_ttl() {
    let store = Arc::new(MemoryLockStore::new());
    let run_a = Arc::new(AtomicBool::new(true));
    let run_b = Arc::new(AtomicBool::new(true));

    let flag_a = Arc::new(LeaderFlag::new());
    let agent_a = LeaderAgent::new(&lock_config(2), store.clone(), flag_a.clone(), "10.0.0.1:1026".to_string());
    let run = run_a.clone();
    let task_a = tokio::spawn(async move {
        agent_a.run(move || run.load(Ordering::SeqCst)).await;
    });

    // A wins first.
    assert!(
        common::wait_for(Duration::from_secs(5), || flag_a.is_leader()).await,
        "A never became leader"
    );

    let flag_b = Arc::new(LeaderFlag::new());
    let agent_b = LeaderAgent::new(&lock_config(2), store.clone(), flag_b.clone(), "10.0.0.2:1026".to_string());
    let run = run_b.clone();
    let task_b = tokio::spawn(async move {
        agent_b.run(move || run.load(Ordering::SeqCst)).await;
    });

    // B keeps contending but cannot take the key while A holds it.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!flag_b.is_leader());

    // A crashes: its lease (the first granted) evaporates.
    store.expire_lease(1);
    assert!(
        common::wait_for(Duration::from_secs(10), || flag_b.is_leader()).await,
        "B never took over"
    );
    assert!(
        common::wait_for(Duration::from_secs(10), || !flag_a.is_leader()).await,
        "A never stepped down"
    );

    run_a.store(false, Ordering::SeqCst);
    run_b.store(false, Ordering::SeqCst);
    task_a.abort();
    task_b.abort();
}

#[tokio::test]
async fn test_leader_callback_fires_on_transitions() {
    let store = Arc::new(MemoryLockStore::new());
    let flag = Arc::new(LeaderFlag::new());
    let mut agent = LeaderAgent::new(&lock_config(2), store.clone(), flag.clone(), "10.0.0.1:1026".to_string());

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    agent.set_callback(Arc::new(move |is_leader| {
        sink.lock().unwrap().push(is_leader);
    }));

    let run = Arc::new(AtomicBool::new(true));
    let run_clone = run.clone();
    let task = tokio::spawn(async move {
        agent.run(move || run_clone.load(Ordering::SeqCst)).await;
    });

    assert!(common::wait_for(Duration::from_secs(5), || flag.is_leader()).await);
    store.expire_lease(1);
    assert!(
        common::wait_for(Duration::from_secs(10), || {
            seen.lock().unwrap().contains(&false)
        })
        .await
    );
    assert_eq!(seen.lock().unwrap()[0], true);

    run.store(false, Ordering::SeqCst);
    task.abort();
}
