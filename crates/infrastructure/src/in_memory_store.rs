use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use taskman_core::{
    AttemptRecord, Clock, CronState, InstanceStatus, LeaseStatus, SchedulerError,
    SchedulerResult, SystemClock, TaskInstance, TaskStore,
};

pub(crate) const LEASE_EXPIRED_EXHAUSTED: &str = "租约过期且重试次数已耗尽";

#[derive(Default)]
struct StoreState {
    instances: HashMap<Uuid, TaskInstance>,
    /// 幂等键 -> 实例ID
    idempotency_keys: HashMap<String, Uuid>,
    attempts: HashMap<Uuid, Vec<AttemptRecord>>,
}

impl StoreState {
    fn owned_mut(&mut self, id: Uuid, owner: &str) -> SchedulerResult<&mut TaskInstance> {
        match self.instances.get_mut(&id) {
            Some(instance) if instance.is_owned_by(owner) => Ok(instance),
            Some(_) => Err(SchedulerError::LeaseLost { id }),
            None => Err(SchedulerError::InstanceNotFound { id }),
        }
    }
}

/// 内存任务存储
///
/// 单进程模式使用，所有操作在一把互斥锁内完成，天然满足原子认领。
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
        }
    }

    /// 当前保存的实例数量
    pub async fn len(&self) -> usize {
        self.state.lock().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<TaskInstance> {
        let state = self.state.lock().await;
        let mut instances: Vec<_> = state.instances.values().cloned().collect();
        instances.sort_by_key(|i| (i.created_at, i.id));
        instances
    }
}

fn clear_lease(instance: &mut TaskInstance) {
    instance.lease_owner = None;
    instance.lease_expiry = None;
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id, task_name = %instance.task_name))]
    async fn insert(&self, instance: &TaskInstance) -> SchedulerResult<Uuid> {
        let mut state = self.state.lock().await;

        if let Some(key) = &instance.idempotency_key {
            if let Some(existing_id) = state.idempotency_keys.get(key) {
                return Err(SchedulerError::DuplicateInstance {
                    key: key.clone(),
                    existing_id: *existing_id,
                });
            }
        }
        if state.instances.contains_key(&instance.id) {
            return Err(SchedulerError::Internal(format!(
                "实例ID冲突: {}",
                instance.id
            )));
        }

        if let Some(key) = &instance.idempotency_key {
            state.idempotency_keys.insert(key.clone(), instance.id);
        }
        state.instances.insert(instance.id, instance.clone());
        debug!("任务实例已保存");
        Ok(instance.id)
    }

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<TaskInstance>> {
        Ok(self.state.lock().await.instances.get(&id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> SchedulerResult<Vec<TaskInstance>> {
        let state = self.state.lock().await;
        let mut found: Vec<_> = state
            .instances
            .values()
            .filter(|i| i.reference.as_deref() == Some(reference))
            .cloned()
            .collect();
        found.sort_by_key(|i| (i.created_at, i.id));
        Ok(found)
    }

    #[instrument(skip(self))]
    async fn claim_due(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> SchedulerResult<Vec<TaskInstance>> {
        let lease_expiry = now
            + chrono::Duration::from_std(lease_ttl)
                .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let mut state = self.state.lock().await;

        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, Uuid)> = state
            .instances
            .values()
            .filter(|i| match i.status {
                InstanceStatus::Pending => i.eta <= now,
                InstanceStatus::Leased => i.lease_expiry.is_some_and(|expiry| expiry < now),
                _ => false,
            })
            .map(|i| (i.eta, i.created_at, i.id))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, _, id) in due {
            if claimed.len() >= limit {
                break;
            }
            let Some(instance) = state.instances.get_mut(&id) else {
                continue;
            };

            if instance.attempt_count >= instance.max_attempts {
                warn!(instance_id = %id, "实例租约过期且已无剩余尝试次数，标记为失败");
                instance.status = InstanceStatus::Failed;
                instance.last_error = Some(LEASE_EXPIRED_EXHAUSTED.to_string());
                instance.updated_at = now;
                clear_lease(instance);
                continue;
            }

            if instance.status == InstanceStatus::Leased {
                warn!(
                    instance_id = %id,
                    previous_owner = ?instance.lease_owner,
                    "回收过期租约"
                );
            }

            instance.status = InstanceStatus::Leased;
            instance.lease_owner = Some(owner.to_string());
            instance.lease_expiry = Some(lease_expiry);
            instance.attempt_count += 1;
            instance.updated_at = now;
            claimed.push(instance.clone());
        }

        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        id: Uuid,
        owner: &str,
        until: DateTime<Utc>,
    ) -> SchedulerResult<LeaseStatus> {
        let mut state = self.state.lock().await;
        let Some(instance) = state.instances.get_mut(&id) else {
            return Ok(LeaseStatus::Lost);
        };

        if instance.status == InstanceStatus::Cancelled {
            return Ok(LeaseStatus::Cancelled);
        }
        if !instance.is_owned_by(owner) {
            return Ok(LeaseStatus::Lost);
        }

        instance.lease_expiry = Some(until);
        Ok(LeaseStatus::Held)
    }

    async fn release_lease(&self, id: Uuid, owner: &str) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let instance = state.owned_mut(id, owner)?;

        instance.status = InstanceStatus::Pending;
        instance.attempt_count = instance.attempt_count.saturating_sub(1);
        instance.updated_at = now;
        clear_lease(instance);
        Ok(())
    }

    #[instrument(skip(self, record))]
    async fn mark_succeeded(
        &self,
        id: Uuid,
        owner: &str,
        record: &AttemptRecord,
    ) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let instance = state.owned_mut(id, owner)?;

        instance.status = InstanceStatus::Succeeded;
        instance.updated_at = now;
        clear_lease(instance);

        state.attempts.entry(id).or_default().push(record.clone());
        Ok(())
    }

    #[instrument(skip(self, record))]
    async fn mark_failed(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        next_eta: Option<DateTime<Utc>>,
        record: Option<&AttemptRecord>,
    ) -> SchedulerResult<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let instance = state.owned_mut(id, owner)?;

        instance.last_error = Some(error.to_string());
        instance.updated_at = now;
        clear_lease(instance);
        match next_eta {
            Some(eta) => {
                instance.status = InstanceStatus::Pending;
                instance.eta = instance.eta.max(eta);
            }
            None => instance.status = InstanceStatus::Failed,
        }

        if let Some(record) = record {
            state.attempts.entry(id).or_default().push(record.clone());
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> SchedulerResult<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let instance = state
            .instances
            .get_mut(&id)
            .ok_or(SchedulerError::InstanceNotFound { id })?;

        if !matches!(
            instance.status,
            InstanceStatus::Pending | InstanceStatus::Leased
        ) {
            return Ok(false);
        }

        instance.status = InstanceStatus::Cancelled;
        instance.updated_at = now;
        clear_lease(instance);
        Ok(true)
    }

    async fn cron_state(&self, task_name: &str) -> SchedulerResult<CronState> {
        let state = self.state.lock().await;
        let mut cron_state = CronState::default();
        for instance in state
            .instances
            .values()
            .filter(|i| i.task_name == task_name && i.fire_time.is_some())
        {
            if matches!(
                instance.status,
                InstanceStatus::Pending | InstanceStatus::Leased
            ) {
                cron_state.active = true;
            }
            cron_state.last_fire_time = cron_state.last_fire_time.max(instance.fire_time);
        }
        Ok(cron_state)
    }

    async fn attempts(&self, id: Uuid) -> SchedulerResult<Vec<AttemptRecord>> {
        let state = self.state.lock().await;
        if !state.instances.contains_key(&id) {
            return Err(SchedulerError::InstanceNotFound { id });
        }
        Ok(state.attempts.get(&id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use taskman_core::{AttemptOutcome, ManualClock, RetryPolicy};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn instance(name: &str, eta: DateTime<Utc>, max_attempts: u32) -> TaskInstance {
        let policy = RetryPolicy::fixed(max_attempts, Duration::from_secs(5));
        TaskInstance::new(name, serde_json::json!({}), eta, policy, start())
    }

    fn record(id: Uuid, attempt: u32, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            instance_id: id,
            attempt,
            started_at: start(),
            finished_at: start(),
            outcome,
            result: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key() {
        let store = InMemoryTaskStore::new();
        let first = instance("a", start(), 3).with_idempotency_key("k");
        let id = store.insert(&first).await.unwrap();

        let second = instance("a", start(), 3).with_idempotency_key("k");
        match store.insert(&second).await {
            Err(SchedulerError::DuplicateInstance { existing_id, .. }) => assert_eq!(existing_id, id),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_claim_respects_eta_limit_and_ownership() {
        let store = InMemoryTaskStore::new();
        let now = start();
        for i in 0..3 {
            store
                .insert(&instance("a", now - chrono::Duration::seconds(i), 3))
                .await
                .unwrap();
        }
        store
            .insert(&instance("a", now + chrono::Duration::seconds(60), 3))
            .await
            .unwrap();

        let claimed = store
            .claim_due("node-a", 2, now, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|i| i.is_owned_by("node-a")));
        assert!(claimed.iter().all(|i| i.attempt_count == 1));
        assert!(claimed[0].eta <= claimed[1].eta);

        let rest = store
            .claim_due("node-b", 10, now, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);

        let err = store
            .mark_succeeded(claimed[0].id, "node-b", &record(claimed[0].id, 1, AttemptOutcome::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_or_failed() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = InMemoryTaskStore::with_clock(clock.clone());
        let retryable = instance("a", start(), 2);
        let exhausted = instance("b", start(), 1);
        store.insert(&retryable).await.unwrap();
        store.insert(&exhausted).await.unwrap();

        let claimed = store
            .claim_due("node-a", 10, start(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);

        let later = start() + chrono::Duration::seconds(31);
        let reclaimed = store
            .claim_due("node-b", 10, later, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, retryable.id);
        assert_eq!(reclaimed[0].attempt_count, 2);

        let failed = store.get(exhausted.id).await.unwrap().unwrap();
        assert_eq!(failed.status, InstanceStatus::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some(LEASE_EXPIRED_EXHAUSTED));
    }

    #[tokio::test]
    async fn test_mark_failed_retry_and_release() {
        let store = InMemoryTaskStore::new();
        let inst = instance("a", start(), 3);
        store.insert(&inst).await.unwrap();
        store
            .claim_due("node-a", 1, start(), Duration::from_secs(30))
            .await
            .unwrap();

        let next = start() + chrono::Duration::seconds(5);
        store
            .mark_failed(inst.id, "node-a", "boom", Some(next), Some(&record(inst.id, 1, AttemptOutcome::Failed)))
            .await
            .unwrap();
        let after = store.get(inst.id).await.unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Pending);
        assert_eq!(after.eta, next);
        assert_eq!(after.attempt_count, 1);
        assert_eq!(after.last_error.as_deref(), Some("boom"));
        assert!(after.lease_owner.is_none());

        store
            .claim_due("node-a", 1, next, Duration::from_secs(30))
            .await
            .unwrap();
        store.release_lease(inst.id, "node-a").await.unwrap();
        let released = store.get(inst.id).await.unwrap().unwrap();
        assert_eq!(released.status, InstanceStatus::Pending);
        assert_eq!(released.attempt_count, 1);
        assert_eq!(store.attempts(inst.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_leased() {
        let store = InMemoryTaskStore::new();
        let pending = instance("a", start(), 3);
        let leased = instance("a", start() - chrono::Duration::seconds(1), 3);
        store.insert(&pending).await.unwrap();
        store.insert(&leased).await.unwrap();
        store
            .claim_due("node-a", 1, start() - chrono::Duration::milliseconds(500), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(store.cancel(leased.id).await.unwrap());
        assert_eq!(
            store.extend_lease(leased.id, "node-a", start()).await.unwrap(),
            LeaseStatus::Cancelled
        );
        assert!(store.cancel(pending.id).await.unwrap());
        assert!(!store.cancel(pending.id).await.unwrap());

        let claimed = store
            .claim_due("node-a", 10, start() + chrono::Duration::hours(1), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert!(matches!(
            store.cancel(Uuid::new_v4()).await,
            Err(SchedulerError::InstanceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cron_state_tracks_fire_times() {
        let store = InMemoryTaskStore::new();
        assert_eq!(store.cron_state("tick").await.unwrap(), CronState::default());

        let fire = start() + chrono::Duration::minutes(1);
        let inst = instance("tick", fire, 1).with_fire_time(fire);
        store.insert(&inst).await.unwrap();
        store.insert(&instance("tick", start(), 1)).await.unwrap();

        let state = store.cron_state("tick").await.unwrap();
        assert!(state.active);
        assert_eq!(state.last_fire_time, Some(fire));

        store.cancel(inst.id).await.unwrap();
        let state = store.cron_state("tick").await.unwrap();
        assert!(!state.active);
        assert_eq!(state.last_fire_time, Some(fire));
    }
}
