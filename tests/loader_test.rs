mod common;

use common::FakeProvider;
use qwq_serve::loader;
use qwq_serve::protocol::HealthStatus;
use qwq_serve::{LoadPolicy, LoadState, ModelProvider, ModelSlot};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_policy(max_attempts: u32) -> LoadPolicy {
    LoadPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    }
}

#[test]
fn test_backoff_doubles_and_caps() {
    let policy = LoadPolicy {
        max_attempts: 10,
        initial_backoff: Duration::from_secs(2),
        max_backoff: Duration::from_secs(60),
    };

    assert_eq!(policy.backoff(1), Duration::from_secs(2));
    assert_eq!(policy.backoff(2), Duration::from_secs(4));
    assert_eq!(policy.backoff(3), Duration::from_secs(8));
    assert_eq!(policy.backoff(5), Duration::from_secs(32));
    assert_eq!(policy.backoff(6), Duration::from_secs(60));
    assert_eq!(policy.backoff(40), Duration::from_secs(60));
}

#[tokio::test]
async fn test_retries_until_load_succeeds() {
    let slot = Arc::new(ModelSlot::new());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    loader::supervise(slot.clone(), fast_policy(5), move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt < 3 {
                anyhow::bail!("weights not found (attempt {attempt})");
            }
            Ok::<_, anyhow::Error>(Arc::new(FakeProvider::new()) as Arc<dyn ModelProvider>)
        }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(slot.provider().is_some());

    let health = slot.health();
    assert_eq!(health.status, HealthStatus::Ready);
    assert_eq!(health.attempts, 3);
    assert!(health.last_error.is_none());
}

#[tokio::test]
async fn test_gives_up_and_stays_initializing() {
    let slot = Arc::new(ModelSlot::new());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    loader::supervise(slot.clone(), fast_policy(2), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<Arc<dyn ModelProvider>, _>(anyhow::anyhow!("out of memory")) }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(slot.provider().is_none());
    assert!(slot.subscribe().borrow().is_failed());

    let health = slot.health();
    assert_eq!(health.status, HealthStatus::Initializing);
    assert_eq!(health.attempts, 2);
    assert_eq!(health.last_error.as_deref(), Some("out of memory"));
}

#[tokio::test]
async fn test_single_attempt_policy_does_not_retry() {
    let slot = Arc::new(ModelSlot::new());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    loader::supervise(slot.clone(), LoadPolicy::single_attempt(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<Arc<dyn ModelProvider>, _>(anyhow::anyhow!("network unreachable")) }
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(slot.health().status, HealthStatus::Initializing);
}

#[tokio::test]
async fn test_health_exposes_progress_while_retrying() {
    let slot = Arc::new(ModelSlot::new());
    let policy = LoadPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
    };

    let mut state = slot.subscribe();
    let task = tokio::spawn(loader::supervise(slot.clone(), policy, || async {
        Err::<Arc<dyn ModelProvider>, _>(anyhow::anyhow!("connection reset"))
    }));

    state
        .wait_for(|s| matches!(s, LoadState::Initializing { last_error: Some(_), .. }))
        .await
        .unwrap();

    let health = slot.health();
    assert_eq!(health.status, HealthStatus::Initializing);
    assert_eq!(health.attempts, 1);
    assert_eq!(health.last_error.as_deref(), Some("connection reset"));

    task.abort();
}
