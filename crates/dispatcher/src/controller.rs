use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use taskman_core::{
    AttemptRecord, Clock, InstanceSnapshot, RetryPolicy, SchedulerError, SchedulerResult,
    SystemClock, TaskInstance, TaskStore, TraceContext,
};
use taskman_infrastructure::{CrossComponentTracer, MetricsCollector, TaskTracer};
use taskman_worker::WorkerPool;

use crate::registry::TaskRegistry;

/// 单次调度调用的可选参数
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// 最早执行时间，默认立即
    pub eta: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    /// 外部业务引用，可据此查询实例
    pub reference: Option<String>,
    /// 覆盖任务定义上的重试策略
    pub retry_policy: Option<RetryPolicy>,
    /// 覆盖任务定义上的超时时间
    pub timeout: Option<Duration>,
    /// 调用方传入的追踪上下文，当前span没有有效上下文时使用
    pub trace: Option<TraceContext>,
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// 任务管理的对外入口：调度、取消和查询实例
pub struct TaskController {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    pool: Option<Arc<WorkerPool>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl TaskController {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            store,
            registry,
            pool: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// 与本节点的执行池关联后，取消操作可以立即停止本地正在执行的实例
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// 为已注册的任务创建一个待执行实例
    ///
    /// 幂等键已存在时不会创建新实例，直接返回已有实例的ID。
    pub async fn schedule(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        options: ScheduleOptions,
    ) -> SchedulerResult<Uuid> {
        let definition = self.registry.resolve(task_name)?;

        let policy = match options.retry_policy {
            Some(policy) => {
                policy.validate().map_err(|e| {
                    SchedulerError::Configuration(format!("任务 {task_name} 的重试策略无效: {e}"))
                })?;
                policy
            }
            None => definition.retry_policy(),
        };

        let timeout_ms = options
            .timeout
            .map(|timeout| {
                i64::try_from(timeout.as_millis()).map_err(|_| {
                    SchedulerError::Configuration(format!("任务 {task_name} 的超时时间超出范围"))
                })
            })
            .transpose()?;

        let span = TaskTracer::schedule_task_span(task_name);
        let trace = span
            .in_scope(CrossComponentTracer::current)
            .or(options.trace)
            .unwrap_or_else(CrossComponentTracer::new_root);

        let now = self.clock.now();
        let mut instance = TaskInstance::new(
            definition.name.clone(),
            payload,
            options.eta.unwrap_or(now),
            policy,
            now,
        )
        .with_trace(trace);
        if let Some(key) = options.idempotency_key {
            instance = instance.with_idempotency_key(key);
        }
        if let Some(reference) = options.reference {
            instance = instance.with_reference(reference);
        }
        if let Some(timeout_ms) = timeout_ms {
            instance = instance.with_timeout_ms(timeout_ms);
        }

        match self.store.insert(&instance).instrument(span).await {
            Ok(id) => {
                self.metrics.record_scheduled(task_name);
                info!(instance_id = %id, task = task_name, eta = %instance.eta, "任务实例已创建");
                Ok(id)
            }
            Err(SchedulerError::DuplicateInstance { key, existing_id }) => {
                debug!(instance_id = %existing_id, key = %key, "幂等键已存在，返回已有实例");
                Ok(existing_id)
            }
            Err(e) => Err(e),
        }
    }

    /// 取消实例，返回是否发生了状态变化
    ///
    /// 已处于终态的实例保持不变。正在本节点执行的实例会立即收到取消信号，
    /// 其他节点上的执行在下一次心跳时停止。
    pub async fn cancel(&self, id: Uuid) -> SchedulerResult<bool> {
        let changed = self.store.cancel(id).await?;
        if changed {
            info!(instance_id = %id, "任务实例已取消");
            if let Some(pool) = &self.pool {
                if pool.cancel_local(id).await {
                    debug!(instance_id = %id, "已通知本地执行停止");
                }
            }
        }
        Ok(changed)
    }

    pub async fn status(&self, id: Uuid) -> SchedulerResult<InstanceSnapshot> {
        self.store
            .get(id)
            .await?
            .map(|instance| instance.snapshot())
            .ok_or(SchedulerError::InstanceNotFound { id })
    }

    pub async fn find_by_reference(&self, reference: &str) -> SchedulerResult<Vec<InstanceSnapshot>> {
        Ok(self
            .store
            .find_by_reference(reference)
            .await?
            .iter()
            .map(TaskInstance::snapshot)
            .collect())
    }

    /// 实例的尝试历史，按尝试序号排列
    pub async fn attempts(&self, id: Uuid) -> SchedulerResult<Vec<AttemptRecord>> {
        if self.store.get(id).await?.is_none() {
            return Err(SchedulerError::InstanceNotFound { id });
        }
        self.store.attempts(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskDefinition;
    use chrono::TimeZone;
    use taskman_core::{handler_fn, InstanceStatus, ManualClock, TaskContext};
    use taskman_infrastructure::InMemoryTaskStore;

    fn controller() -> (TaskController, Arc<InMemoryTaskStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let mut builder = TaskRegistry::builder();
        builder
            .register(
                TaskDefinition::new(
                    "send_email",
                    handler_fn(|_ctx: TaskContext| async { Ok(serde_json::Value::Null) }),
                )
                .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(5))),
            )
            .unwrap();
        let controller = TaskController::new(store.clone(), Arc::new(builder.build()))
            .with_clock(clock.clone());
        (controller, store, clock)
    }

    #[tokio::test]
    async fn test_schedule_uses_definition_policy_and_now() {
        let (controller, store, clock) = controller();
        let id = controller
            .schedule("send_email", serde_json::json!({"to": "a@b"}), ScheduleOptions::new())
            .await
            .unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Pending);
        assert_eq!(stored.eta, clock.now());
        assert_eq!(stored.max_attempts, 3);
        assert_eq!(stored.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_schedule_unknown_task() {
        let (controller, _, _) = controller();
        let err = controller
            .schedule("missing", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTask { name } if name == "missing"));
    }

    #[tokio::test]
    async fn test_schedule_idempotency_key_returns_existing() {
        let (controller, _, _) = controller();
        let options = ScheduleOptions::new().with_idempotency_key("order-42");
        let first = controller
            .schedule("send_email", serde_json::Value::Null, options.clone())
            .await
            .unwrap();
        let second = controller
            .schedule("send_email", serde_json::Value::Null, options)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_schedule_rejects_invalid_override_policy() {
        let (controller, _, _) = controller();
        let options =
            ScheduleOptions::new().with_retry_policy(RetryPolicy::fixed(0, Duration::from_secs(1)));
        let err = controller
            .schedule("send_email", serde_json::Value::Null, options)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_cancel_and_status() {
        let (controller, _, clock) = controller();
        let id = controller
            .schedule(
                "send_email",
                serde_json::Value::Null,
                ScheduleOptions::new()
                    .at(clock.now() + chrono::Duration::hours(1))
                    .with_reference("user-7"),
            )
            .await
            .unwrap();

        assert!(controller.cancel(id).await.unwrap());
        assert!(!controller.cancel(id).await.unwrap());
        assert_eq!(controller.status(id).await.unwrap().status, InstanceStatus::Cancelled);

        let by_ref = controller.find_by_reference("user-7").await.unwrap();
        assert_eq!(by_ref.len(), 1);
        assert_eq!(by_ref[0].id, id);

        let missing = Uuid::new_v4();
        assert!(matches!(
            controller.status(missing).await.unwrap_err(),
            SchedulerError::InstanceNotFound { .. }
        ));
        assert!(controller.attempts(missing).await.is_err());
        assert!(controller.attempts(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_rejects_out_of_range_timeout() {
        let (controller, store, _) = controller();
        let options = ScheduleOptions::new().with_timeout(Duration::from_secs(u64::MAX));
        let err = controller
            .schedule("send_email", serde_json::Value::Null, options)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert!(store.is_empty().await);

        let id = controller
            .schedule(
                "send_email",
                serde_json::Value::Null,
                ScheduleOptions::new().with_timeout(Duration::from_secs(90)),
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().timeout_ms, Some(90_000));
    }

    #[tokio::test]
    async fn test_schedule_keeps_caller_trace() {
        let (controller, store, _) = controller();
        let caller = TraceContext::new(
            "4bf92f3577b34da6a3ce929d0e0e4736",
            Some("00f067aa0ba902b7".to_string()),
        );
        let id = controller
            .schedule(
                "send_email",
                serde_json::Value::Null,
                ScheduleOptions::new().with_trace(caller.clone()),
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().trace(), caller);
    }
}
