use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use taskman_core::{
    AttemptOutcome, AttemptRecord, Clock, InstanceStatus, LeaseStatus, ManualClock,
    RetryPolicy, SchedulerError, TaskInstance, TaskStore,
};
use taskman_infrastructure::SqliteTaskStore;

async fn setup_store() -> (Arc<ManualClock>, SqliteTaskStore) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ));
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::with_clock(pool, clock.clone());
    store.migrate().await.unwrap();
    (clock, store)
}

fn instance(clock: &ManualClock, task: &str, max_attempts: u32) -> TaskInstance {
    let now = clock.now();
    TaskInstance::new(
        task,
        json!({"to": "a@example.com"}),
        now,
        RetryPolicy::fixed(max_attempts, Duration::from_secs(1)),
        now,
    )
}

fn record(instance: &TaskInstance, attempt: u32, outcome: AttemptOutcome) -> AttemptRecord {
    AttemptRecord {
        instance_id: instance.id,
        attempt,
        started_at: instance.eta,
        finished_at: instance.eta + chrono::Duration::milliseconds(250),
        outcome,
        result: Some(json!({"ok": true})),
        error: None,
    }
}

#[tokio::test]
async fn test_insert_and_get_roundtrip() {
    let (clock, store) = setup_store().await;
    let inst = instance(&clock, "send_email", 3)
        .with_reference("order-1")
        .with_idempotency_key("welcome-1");

    store.insert(&inst).await.unwrap();
    let loaded = store.get(inst.id).await.unwrap().unwrap();
    assert_eq!(loaded.task_name, "send_email");
    assert_eq!(loaded.status, InstanceStatus::Pending);
    assert_eq!(loaded.payload, json!({"to": "a@example.com"}));
    assert_eq!(loaded.eta, inst.eta);
    assert_eq!(loaded.max_attempts, 3);
    assert_eq!(loaded.retry_policy, inst.retry_policy);

    let by_ref = store.find_by_reference("order-1").await.unwrap();
    assert_eq!(by_ref.len(), 1);
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_idempotency_key_returns_existing_id() {
    let (clock, store) = setup_store().await;
    let first = instance(&clock, "send_email", 3).with_idempotency_key("k");
    let second = instance(&clock, "send_email", 3).with_idempotency_key("k");

    store.insert(&first).await.unwrap();
    match store.insert(&second).await {
        Err(SchedulerError::DuplicateInstance { existing_id, .. }) => {
            assert_eq!(existing_id, first.id)
        }
        other => panic!("expected duplicate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_claim_respects_eta_limit_and_order() {
    let (clock, store) = setup_store().await;
    let early = instance(&clock, "a", 3);
    clock.advance(chrono::Duration::seconds(1));
    let later = instance(&clock, "b", 3);
    let mut future = instance(&clock, "c", 3);
    future.eta = clock.now() + chrono::Duration::hours(1);

    for inst in [&later, &future, &early] {
        store.insert(inst).await.unwrap();
    }

    let claimed = store
        .claim_due("node-a", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, early.id);
    assert_eq!(claimed[0].status, InstanceStatus::Leased);
    assert_eq!(claimed[0].attempt_count, 1);
    assert_eq!(claimed[0].lease_owner.as_deref(), Some("node-a"));

    let claimed = store
        .claim_due("node-b", 10, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, later.id);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_by_other_node() {
    let (clock, store) = setup_store().await;
    let inst = instance(&clock, "a", 3);
    store.insert(&inst).await.unwrap();

    store
        .claim_due("node-a", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(31));

    let reclaimed = store
        .claim_due("node-b", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].attempt_count, 2);

    let stale = store
        .extend_lease(inst.id, "node-a", clock.now())
        .await
        .unwrap();
    assert_eq!(stale, LeaseStatus::Lost);
    let err = store
        .mark_succeeded(inst.id, "node-a", &record(&inst, 1, AttemptOutcome::Succeeded))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::LeaseLost { .. }));
}

#[tokio::test]
async fn test_expired_lease_without_attempts_left_fails() {
    let (clock, store) = setup_store().await;
    let inst = instance(&clock, "a", 1);
    store.insert(&inst).await.unwrap();
    store
        .claim_due("node-a", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(60));

    let claimed = store
        .claim_due("node-b", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();
    assert!(claimed.is_empty());
    let loaded = store.get(inst.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, InstanceStatus::Failed);
    assert!(loaded.last_error.is_some());
}

#[tokio::test]
async fn test_mark_failed_with_retry_and_attempt_history() {
    let (clock, store) = setup_store().await;
    let inst = instance(&clock, "a", 3);
    store.insert(&inst).await.unwrap();
    store
        .claim_due("node-a", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();

    let next = clock.now() + chrono::Duration::seconds(5);
    let mut failed = record(&inst, 1, AttemptOutcome::Failed);
    failed.error = Some("smtp down".into());
    failed.result = None;
    store
        .mark_failed(inst.id, "node-a", "smtp down", Some(next), Some(&failed))
        .await
        .unwrap();

    let loaded = store.get(inst.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, InstanceStatus::Pending);
    assert_eq!(loaded.eta, next);
    assert_eq!(loaded.last_error.as_deref(), Some("smtp down"));
    assert!(loaded.lease_owner.is_none());

    assert!(store
        .claim_due("node-a", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap()
        .is_empty());
    clock.advance(chrono::Duration::seconds(5));
    store
        .claim_due("node-a", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();
    store
        .mark_succeeded(inst.id, "node-a", &record(&inst, 2, AttemptOutcome::Succeeded))
        .await
        .unwrap();

    let attempts = store.attempts(inst.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Succeeded);
    assert_eq!(attempts[1].result, Some(json!({"ok": true})));
    assert_eq!(
        store.get(inst.id).await.unwrap().unwrap().status,
        InstanceStatus::Succeeded
    );
}

#[tokio::test]
async fn test_release_lease_returns_attempt() {
    let (clock, store) = setup_store().await;
    let inst = instance(&clock, "a", 3);
    store.insert(&inst).await.unwrap();
    store
        .claim_due("node-a", 1, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();

    assert!(matches!(
        store.release_lease(inst.id, "node-b").await,
        Err(SchedulerError::LeaseLost { .. })
    ));
    store.release_lease(inst.id, "node-a").await.unwrap();

    let loaded = store.get(inst.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, InstanceStatus::Pending);
    assert_eq!(loaded.attempt_count, 0);
}

#[tokio::test]
async fn test_cancel_pending_and_leased() {
    let (clock, store) = setup_store().await;
    let pending = instance(&clock, "a", 3);
    let leased = instance(&clock, "b", 3);
    store.insert(&pending).await.unwrap();
    store.insert(&leased).await.unwrap();
    store
        .claim_due("node-a", 10, clock.now(), Duration::from_secs(30))
        .await
        .unwrap();
    store.release_lease(pending.id, "node-a").await.unwrap();

    assert!(store.cancel(pending.id).await.unwrap());
    assert!(store.cancel(leased.id).await.unwrap());
    assert!(!store.cancel(pending.id).await.unwrap());
    assert!(matches!(
        store.cancel(Uuid::new_v4()).await,
        Err(SchedulerError::InstanceNotFound { .. })
    ));

    let status = store
        .extend_lease(leased.id, "node-a", clock.now())
        .await
        .unwrap();
    assert_eq!(status, LeaseStatus::Cancelled);
    assert!(store
        .claim_due("node-a", 10, clock.now(), Duration::from_secs(30))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_cron_state_tracks_fire_times() {
    let (clock, store) = setup_store().await;
    let state = store.cron_state("report").await.unwrap();
    assert!(!state.active);
    assert!(state.last_fire_time.is_none());

    let fire = clock.now();
    let inst = instance(&clock, "report", 1).with_fire_time(fire);
    store.insert(&inst).await.unwrap();
    let ad_hoc = instance(&clock, "report", 1);
    store.insert(&ad_hoc).await.unwrap();

    let state = store.cron_state("report").await.unwrap();
    assert!(state.active);
    assert_eq!(state.last_fire_time, Some(fire));

    store.cancel(inst.id).await.unwrap();
    let state = store.cron_state("report").await.unwrap();
    assert!(!state.active);
    assert_eq!(state.last_fire_time, Some(fire));
}

#[tokio::test]
async fn test_attempts_for_missing_instance() {
    let (_clock, store) = setup_store().await;
    assert!(matches!(
        store.attempts(Uuid::new_v4()).await,
        Err(SchedulerError::InstanceNotFound { .. })
    ));
}
