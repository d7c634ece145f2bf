use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskman_core::{HandlerError, TaskContext, TaskHandler};
use taskman_infrastructure::MetricsCollector;

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(serde_json::Value),
    Failed(HandlerError),
    TimedOut,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded(_))
    }
}

/// 在超时限制内运行处理器
///
/// 超时后触发上下文中的取消令牌并丢弃处理器future。处理器panic按可重试错误处理。
pub async fn execute(
    handler: Arc<dyn TaskHandler>,
    ctx: TaskContext,
    timeout: Duration,
) -> ExecutionOutcome {
    let cancellation = ctx.cancellation.clone();
    let instance_id = ctx.instance_id;
    let run = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(Ok(value))) => ExecutionOutcome::Succeeded(value),
        Ok(Ok(Err(e))) => ExecutionOutcome::Failed(e),
        Ok(Err(_)) => {
            warn!(instance_id = %instance_id, "处理器panic");
            ExecutionOutcome::Failed(HandlerError::retryable("处理器panic"))
        }
        Err(_) => {
            warn!(instance_id = %instance_id, timeout_ms = timeout.as_millis() as u64, "任务执行超时");
            cancellation.cancel();
            ExecutionOutcome::TimedOut
        }
    }
}

/// 工作槽位，释放即归还并发额度
#[derive(Debug)]
pub struct SlotPermit {
    _global: OwnedSemaphorePermit,
    _task: Option<OwnedSemaphorePermit>,
}

/// 有界并发的执行池
///
/// 全局信号量限制在途实例总数，可选的按任务信号量限制单个任务定义的并发数。
/// 每个执行持有一个派生自停机令牌的取消令牌；停机宽限期结束后仍在运行的
/// 执行会被放弃，其租约留待自然过期。
pub struct WorkerPool {
    max_in_flight: usize,
    global: Arc<Semaphore>,
    per_task: RwLock<HashMap<String, Arc<Semaphore>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    abandon: CancellationToken,
    running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    metrics: Arc<MetricsCollector>,
}

impl WorkerPool {
    pub fn new(max_in_flight: usize) -> Self {
        Self::with_metrics(max_in_flight, Arc::new(MetricsCollector::new()))
    }

    pub fn with_metrics(max_in_flight: usize, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            max_in_flight,
            global: Arc::new(Semaphore::new(max_in_flight)),
            per_task: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            abandon: CancellationToken::new(),
            running: Arc::new(RwLock::new(HashMap::new())),
            metrics,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// 可用槽位数，停机后为0
    pub fn available_slots(&self) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        self.global.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 预留一个槽位，全局或任务级额度不足时返回 `None`
    pub async fn try_reserve(
        &self,
        task_name: &str,
        max_concurrency: Option<usize>,
    ) -> Option<SlotPermit> {
        if self.is_shutting_down() {
            return None;
        }

        let task = match max_concurrency {
            Some(limit) => {
                let semaphore = self.task_semaphore(task_name, limit).await;
                Some(semaphore.try_acquire_owned().ok()?)
            }
            None => None,
        };
        let global = self.global.clone().try_acquire_owned().ok()?;

        Some(SlotPermit {
            _global: global,
            _task: task,
        })
    }

    async fn task_semaphore(&self, task_name: &str, limit: usize) -> Arc<Semaphore> {
        if let Some(semaphore) = self.per_task.read().await.get(task_name) {
            return semaphore.clone();
        }
        self.per_task
            .write()
            .await
            .entry(task_name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    /// 为一次执行创建取消令牌，停机时随之触发
    pub fn execution_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// 在池中运行一次执行
    pub async fn spawn<F>(&self, instance_id: Uuid, token: CancellationToken, permit: SlotPermit, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.running.write().await.insert(instance_id, token);

        let running = self.running.clone();
        let abandon = self.abandon.clone();
        let metrics = self.metrics.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = work => {}
                _ = abandon.cancelled() => {
                    warn!(instance_id = %instance_id, "宽限期已过，放弃执行，租约将自然过期");
                }
            }
            running.write().await.remove(&instance_id);
            drop(permit);
            metrics.set_in_flight(tracker.len().saturating_sub(1));
        });
        self.metrics.set_in_flight(self.tracker.len());
    }

    /// 取消本节点上正在执行的实例
    pub async fn cancel_local(&self, instance_id: Uuid) -> bool {
        match self.running.read().await.get(&instance_id) {
            Some(token) => {
                debug!(instance_id = %instance_id, "触发本地取消令牌");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 等待当前所有执行结束，不影响新执行的提交
    pub async fn wait_idle(&self) {
        while !self.tracker.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn is_running(&self, instance_id: Uuid) -> bool {
        self.running.read().await.contains_key(&instance_id)
    }

    /// 优雅停机
    ///
    /// 停止接受新执行并触发所有执行的取消令牌，最多等待 `grace`；
    /// 超时后放弃剩余执行。
    pub async fn shutdown(&self, grace: Duration) {
        info!("Worker pool shutting down, {} executions in flight", self.tracker.len());
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "{} executions still running after {:?} grace period, abandoning",
                self.tracker.len(),
                grace
            );
            self.abandon.cancel();
            self.tracker.wait().await;
        }
        self.metrics.set_in_flight(0);
        info!("Worker pool stopped");
    }
}
