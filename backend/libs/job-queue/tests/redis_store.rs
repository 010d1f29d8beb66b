//! Redis job store tests. They need a running server:
//!
//! ```sh
//! REDIS_URL=redis://127.0.0.1:6379 cargo test -p job-queue --test redis_store -- --ignored
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use job_queue::{JobError, JobRecord, JobState, JobStore, RedisJobStore};
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use uuid::Uuid;

async fn store() -> RedisJobStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(url).expect("valid REDIS_URL");
    let manager = ConnectionManager::new(client).await.expect("redis reachable");
    // Unique prefix per test run keeps runs independent.
    RedisJobStore::new(
        Arc::new(Mutex::new(manager)),
        format!("jobq-test-{}", Uuid::new_v4()),
    )
}

async fn enqueue(store: &RedisJobStore, queue: &str, max_attempts: u32) -> JobRecord {
    let now = Utc::now();
    let record: JobRecord = serde_json::from_value(serde_json::json!({
        "id": Uuid::new_v4(),
        "queueName": queue,
        "kind": "test",
        "payload": { "n": 1 },
        "attempts": 0,
        "maxAttempts": max_attempts,
        "state": "pending",
        "nextRunAt": now,
        "createdAt": now,
        "updatedAt": now,
    }))
    .unwrap();
    store.insert(record).await.unwrap()
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_redis_lease_complete_roundtrip() {
    let store = store().await;
    let first = enqueue(&store, "q", 3).await;
    let second = enqueue(&store, "q", 3).await;
    assert!(second.seq() > first.seq());

    let now = Utc::now();
    let leased = store
        .lease_next("q", now, now + Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.id(), first.id);
    assert_eq!(leased.attempt(), 1);

    let done = store.complete(first.id, leased.token, now).await.unwrap();
    assert_eq!(done.state, JobState::Completed);

    let stats = store.stats("q").await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_redis_recovery_invalidates_stale_token() {
    let store = store().await;
    let record = enqueue(&store, "q", 3).await;

    let now = Utc::now();
    let stale = store
        .lease_next("q", now, now + Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();

    let recovered = store
        .recover_expired(now + Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].state, JobState::Pending);

    let later = now + Duration::seconds(2);
    let fresh = store
        .lease_next("q", later, later + Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.attempt(), 2);

    let err = store.complete(record.id, stale.token, later).await.unwrap_err();
    assert!(matches!(err, JobError::LeaseLost(_)));
    store.complete(record.id, fresh.token, later).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_redis_dead_letter_replay_and_purge() {
    let store = store().await;
    let record = enqueue(&store, "q", 1).await;

    let now = Utc::now();
    let leased = store.lease_next("q", now, now).await.unwrap().unwrap();
    store
        .dead_letter(record.id, leased.token, "boom", now)
        .await
        .unwrap();

    let dead = store.dead_letters("q", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("boom"));

    let replayed = store.replay(record.id, now).await.unwrap();
    assert_eq!(replayed.attempts, 0);
    assert!(store.dead_letters("q", 10).await.unwrap().is_empty());

    let leased = store.lease_next("q", now, now).await.unwrap().unwrap();
    store
        .dead_letter(record.id, leased.token, "boom again", now)
        .await
        .unwrap();
    assert_eq!(
        store
            .purge_finished(now + Duration::seconds(1))
            .await
            .unwrap(),
        1
    );
    assert!(store.get(record.id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a running Redis (REDIS_URL)"]
async fn test_redis_concurrent_leases_are_exclusive_and_recorded() {
    let store = Arc::new(store().await);
    let mut expected = Vec::new();
    for _ in 0..20 {
        expected.push(enqueue(&store, "q", 3).await.id);
    }

    let now = Utc::now();
    let mut workers = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        workers.push(tokio::spawn(async move {
            let mut leased = Vec::new();
            while let Some(job) = store
                .lease_next("q", now, now + Duration::seconds(30))
                .await
                .unwrap()
            {
                // The stored record reflects the lease as soon as it is granted.
                let stored = store.get(job.id()).await.unwrap().unwrap();
                assert_eq!(stored.state, JobState::Leased);
                assert_eq!(stored.attempts, 1);
                assert_eq!(stored.lease_expiry, Some(now + Duration::seconds(30)));
                leased.push(job.id());
            }
            leased
        }));
    }

    let mut leased = Vec::new();
    for worker in workers {
        leased.extend(worker.await.unwrap());
    }
    // A worker gives up after repeatedly losing claims; sweep what is left.
    while let Some(job) = store
        .lease_next("q", now, now + Duration::seconds(30))
        .await
        .unwrap()
    {
        leased.push(job.id());
    }
    leased.sort();
    expected.sort();
    assert_eq!(leased, expected);

    let stats = store.stats("q").await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.leased, 20);
}
