//! 调度核心
//!
//! 每个进程运行一个轮询循环。一个周期依次完成：周期任务规划、容量检查、
//! 从任务存储认领到期实例、为每个实例获取分布式锁，然后把执行连同租约心跳
//! 一起交给执行池。执行结束后按结果写回存储：成功、按重试策略重新排期、
//! 或进入终态失败。租约丢失或实例被取消时不写任何结果。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use taskman_core::config::{SchedulerConfig, WorkerConfig};
use taskman_core::{
    AttemptOutcome, AttemptRecord, Clock, HandlerError, LeaseToken, LockProvider, RetryPolicy,
    SchedulerError, SchedulerResult, SystemClock, TaskContext, TaskInstance, TaskStore,
};
use taskman_infrastructure::{CrossComponentTracer, MetricsCollector, TaskTracer};
use taskman_worker::{execute, ExecutionOutcome, HeartbeatExit, LeaseHeartbeat, WorkerPool};

use crate::registry::{TaskDefinition, TaskRegistry};
use crate::retry_service::{backoff_delay, next_attempt, RetryDecision};

/// 调度器运行参数
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub node_id: String,
    pub poll_interval: Duration,
    pub claim_batch_size: usize,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub max_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl SchedulerSettings {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            poll_interval: Duration::from_secs(1),
            claim_batch_size: 32,
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            max_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }

    pub fn from_config(
        node_id: impl Into<String>,
        scheduler: &SchedulerConfig,
        worker: &WorkerConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            poll_interval: scheduler.poll_interval(),
            claim_batch_size: scheduler.claim_batch_size,
            lease_ttl: scheduler.lease_ttl(),
            heartbeat_interval: scheduler.heartbeat_interval(),
            max_backoff: scheduler.max_backoff(),
            shutdown_grace: worker.shutdown_grace(),
        }
    }
}

/// 单个轮询周期的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// 新规划的周期任务实例
    pub planned: usize,
    pub claimed: usize,
    /// 已交给执行池的实例
    pub dispatched: usize,
    /// 因容量不足或锁竞争而归还的实例
    pub released: usize,
    /// 因任务未注册而直接失败的实例
    pub rejected: usize,
}

/// 执行期间需要的共享组件
#[derive(Clone)]
struct ExecutionEnv {
    store: Arc<dyn TaskStore>,
    lock: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
    pool: Arc<WorkerPool>,
    metrics: Arc<MetricsCollector>,
    settings: Arc<SchedulerSettings>,
}

pub struct TaskScheduler {
    env: ExecutionEnv,
    registry: Arc<TaskRegistry>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        lock: Arc<dyn LockProvider>,
        registry: Arc<TaskRegistry>,
        pool: Arc<WorkerPool>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            env: ExecutionEnv {
                store,
                lock,
                clock: Arc::new(SystemClock),
                pool,
                metrics: Arc::new(MetricsCollector::new()),
                settings: Arc::new(settings),
            },
            registry,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.env.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.env.metrics = metrics;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.env.settings.node_id
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.env.settings
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.env.pool
    }

    /// 轮询循环，直到收到停机信号
    ///
    /// 存储或锁服务故障时按指数退避重试，循环本身不会因错误退出。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let settings = &self.env.settings;
        info!(
            node_id = %settings.node_id,
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            max_in_flight = self.env.pool.max_in_flight(),
            "任务调度器已启动"
        );

        let backoff = RetryPolicy::exponential(
            u32::MAX,
            settings.poll_interval,
            Some(settings.max_backoff.max(settings.poll_interval)),
        );
        let mut consecutive_failures: u32 = 0;

        loop {
            let delay = if consecutive_failures == 0 {
                settings.poll_interval
            } else {
                backoff_delay(&backoff, consecutive_failures)
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到停机信号，停止认领新实例");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.run_cycle().await {
                Ok(report) => {
                    if consecutive_failures > 0 {
                        info!("轮询在连续失败 {} 次后恢复", consecutive_failures);
                    }
                    consecutive_failures = 0;
                    if report.claimed > 0 || report.planned > 0 {
                        debug!(?report, "轮询周期完成");
                    }
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.env.metrics.record_store_error("poll_cycle");
                    if e.is_transient() {
                        warn!("轮询周期失败（第{}次），稍后重试: {}", consecutive_failures, e);
                    } else {
                        error!("轮询周期失败（第{}次）: {}", consecutive_failures, e);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// 停止执行池，宽限期后放弃剩余执行
    pub async fn shutdown(&self) {
        self.env.pool.shutdown(self.env.settings.shutdown_grace).await;
        info!(node_id = %self.env.settings.node_id, "任务调度器已停止");
    }

    /// 执行一个轮询周期
    pub async fn run_cycle(&self) -> SchedulerResult<CycleReport> {
        let span = TaskTracer::poll_cycle_span(&self.env.settings.node_id);
        async {
            let started = Instant::now();
            let mut report = CycleReport {
                planned: self.plan_cron().await?,
                ..CycleReport::default()
            };

            let pool = &self.env.pool;
            let capacity = pool
                .available_slots()
                .min(self.env.settings.claim_batch_size);
            if pool.is_shutting_down() || capacity == 0 {
                debug!("执行池已满或正在停机，跳过认领");
                return Ok(report);
            }

            let now = self.env.clock.now();
            let claimed = self
                .env
                .store
                .claim_due(
                    &self.env.settings.node_id,
                    capacity,
                    now,
                    self.env.settings.lease_ttl,
                )
                .await?;
            report.claimed = claimed.len();
            if !claimed.is_empty() {
                self.env.metrics.record_claimed(claimed.len());
                debug!("认领到 {} 个到期实例", claimed.len());
            }

            for instance in claimed {
                self.dispatch(instance, &mut report).await;
            }

            self.env
                .metrics
                .record_poll_cycle(started.elapsed().as_secs_f64());
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// 为每个周期任务定义保证恰好一个待执行实例
    ///
    /// 只有上一个触发时间的实例进入终态后才创建下一个，长时间运行的执行不会造成积压。
    pub async fn plan_cron(&self) -> SchedulerResult<usize> {
        let now = self.env.clock.now();
        let mut planned = 0;

        for definition in self.registry.cron_definitions() {
            let Some(trigger) = definition.cron() else {
                continue;
            };

            let state = self.env.store.cron_state(&definition.name).await?;
            if state.active {
                continue;
            }

            let after = if definition.catch_up {
                state.last_fire_time.unwrap_or(now)
            } else {
                state.last_fire_time.map_or(now, |last| last.max(now))
            };
            let Some(fire_time) = trigger.next_fire_after(after) else {
                debug!(task = %definition.name, "CRON表达式没有后续触发时间");
                continue;
            };

            let instance = TaskInstance::new(
                definition.name.clone(),
                definition.default_payload.clone(),
                fire_time,
                definition.retry_policy(),
                now,
            )
            .with_fire_time(fire_time)
            .with_idempotency_key(cron_instance_key(&definition.name, fire_time))
            .with_trace(CrossComponentTracer::new_root());

            match self.env.store.insert(&instance).await {
                Ok(id) => {
                    planned += 1;
                    self.env.metrics.record_cron_planned(&definition.name);
                    debug!(
                        task = %definition.name,
                        instance_id = %id,
                        fire_time = %fire_time,
                        "已规划周期任务实例"
                    );
                }
                Err(SchedulerError::DuplicateInstance { .. }) => {
                    debug!(task = %definition.name, "其他节点已规划该触发时间");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(planned)
    }

    async fn dispatch(&self, instance: TaskInstance, report: &mut CycleReport) {
        let env = &self.env;
        let node_id = env.settings.node_id.as_str();

        let definition = match self.registry.resolve(&instance.task_name) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(instance_id = %instance.id, task = %instance.task_name, "实例对应的任务未注册");
                env.metrics.record_failed(&instance.task_name, "unknown_task");
                report.rejected += 1;
                if let Err(e) = env
                    .store
                    .mark_failed(instance.id, node_id, &e.to_string(), None, None)
                    .await
                {
                    warn!(instance_id = %instance.id, "标记实例失败时出错: {}", e);
                }
                return;
            }
        };

        let Some(permit) = env
            .pool
            .try_reserve(&definition.name, definition.max_concurrency)
            .await
        else {
            debug!(instance_id = %instance.id, task = %definition.name, "没有可用的执行槽位，归还实例");
            self.release(&instance, report).await;
            return;
        };

        let token = match env
            .lock
            .acquire(&instance.id.to_string(), env.settings.lease_ttl)
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(instance_id = %instance.id, "锁已被其他节点持有，视为竞争失败");
                env.metrics.record_lock_contention();
                self.release(&instance, report).await;
                return;
            }
            Err(e) => {
                warn!(instance_id = %instance.id, "获取锁失败: {}", e);
                self.release(&instance, report).await;
                return;
            }
        };

        let execution_token = env.pool.execution_token();
        let instance_id = instance.id;
        let work = run_instance(
            env.clone(),
            definition,
            instance,
            token,
            execution_token.clone(),
        );
        env.pool
            .spawn(instance_id, execution_token, permit, work)
            .await;
        report.dispatched += 1;
    }

    async fn release(&self, instance: &TaskInstance, report: &mut CycleReport) {
        report.released += 1;
        if let Err(e) = self
            .env
            .store
            .release_lease(instance.id, &self.env.settings.node_id)
            .await
        {
            warn!(instance_id = %instance.id, "归还实例租约失败: {}", e);
        }
    }
}

/// 周期任务实例的幂等键
pub fn cron_instance_key(task_name: &str, fire_time: DateTime<Utc>) -> String {
    format!("cron:{}:{}", task_name, fire_time.to_rfc3339())
}

fn instance_timeout(definition: &TaskDefinition, instance: &TaskInstance) -> Duration {
    instance
        .timeout_ms
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64))
        .unwrap_or_else(|| definition.timeout())
}

async fn run_instance(
    env: ExecutionEnv,
    definition: Arc<TaskDefinition>,
    instance: TaskInstance,
    token: LeaseToken,
    execution_token: CancellationToken,
) {
    let span = TaskTracer::execute_task_span(&instance, &env.settings.node_id);

    async {
        let started_at = env.clock.now();
        let ctx = TaskContext {
            instance_id: instance.id,
            task_name: instance.task_name.clone(),
            payload: instance.payload.clone(),
            attempt: instance.attempt_count,
            fire_time: instance.fire_time,
            trace: instance.trace(),
            cancellation: execution_token.clone(),
        };
        let heartbeat = LeaseHeartbeat::new(
            env.store.clone(),
            env.lock.clone(),
            env.clock.clone(),
            instance.id,
            env.settings.node_id.clone(),
            token.clone(),
            env.settings.lease_ttl,
            env.settings.heartbeat_interval,
        );

        debug!(attempt = instance.attempt_count, "开始执行实例");
        let done = CancellationToken::new();
        let execution = async {
            let outcome = execute(
                definition.handler.clone(),
                ctx,
                instance_timeout(&definition, &instance),
            )
            .await;
            done.cancel();
            outcome
        };
        let (outcome, exit) = tokio::join!(
            execution,
            heartbeat.run(execution_token.clone(), done.clone())
        );
        let finished_at = env.clock.now();

        // 本地取消直接触发执行令牌，心跳此时已正常退出
        let exit = match exit {
            HeartbeatExit::Stopped
                if execution_token.is_cancelled()
                    && !matches!(outcome, ExecutionOutcome::TimedOut)
                    && !env.pool.is_shutting_down() =>
            {
                HeartbeatExit::CancelRequested
            }
            exit => exit,
        };

        record_outcome(&env, &instance, outcome, exit, started_at, finished_at).await;

        if let Err(e) = env.lock.release(&token).await {
            warn!(instance_id = %instance.id, "释放锁失败，将等待其自然过期: {}", e);
        }
    }
    .instrument(span)
    .await
}

async fn record_outcome(
    env: &ExecutionEnv,
    instance: &TaskInstance,
    outcome: ExecutionOutcome,
    exit: HeartbeatExit,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) {
    let task = instance.task_name.as_str();
    let node_id = env.settings.node_id.as_str();

    match exit {
        HeartbeatExit::LeaseLost => {
            env.metrics.record_lease_lost(task);
            warn!(instance_id = %instance.id, "租约已丢失，不写入执行结果");
            return;
        }
        HeartbeatExit::CancelRequested => {
            env.metrics.record_cancelled(task);
            info!(instance_id = %instance.id, "实例已取消，执行已停止");
            return;
        }
        HeartbeatExit::Stopped => {}
    }

    // 只有响应停机令牌而提前返回的执行才归还；处理器给出的真实结果照常写入
    if matches!(&outcome, ExecutionOutcome::Failed(e) if e.is_interrupted())
        && env.pool.is_shutting_down()
    {
        info!(instance_id = %instance.id, "执行因停机中断，归还实例");
        if let Err(e) = env.store.release_lease(instance.id, node_id).await {
            warn!(instance_id = %instance.id, "归还实例租约失败: {}", e);
        }
        return;
    }

    let mut record = AttemptRecord {
        instance_id: instance.id,
        attempt: instance.attempt_count,
        started_at,
        finished_at,
        outcome: AttemptOutcome::Succeeded,
        result: None,
        error: None,
    };
    let duration = record.duration_ms() as f64 / 1000.0;

    let written = match outcome {
        ExecutionOutcome::Succeeded(value) => {
            record.result = Some(value);
            let written = env.store.mark_succeeded(instance.id, node_id, &record).await;
            if written.is_ok() {
                env.metrics.record_succeeded(task, duration);
                info!(instance_id = %instance.id, duration_ms = record.duration_ms(), "实例执行成功");
            }
            written
        }
        ExecutionOutcome::Failed(HandlerError::Fatal(message)) => {
            record.outcome = AttemptOutcome::Failed;
            record.error = Some(message.clone());
            env.metrics.record_failed(task, "fatal");
            warn!(instance_id = %instance.id, "实例执行失败且不可重试: {}", message);
            env.store
                .mark_failed(instance.id, node_id, &message, None, Some(&record))
                .await
        }
        ExecutionOutcome::Failed(
            HandlerError::Retryable(message) | HandlerError::Interrupted(message),
        ) => {
            record.outcome = AttemptOutcome::Failed;
            record.error = Some(message.clone());
            retry_or_fail(env, instance, &message, &record, finished_at).await
        }
        ExecutionOutcome::TimedOut => {
            let message = format!(
                "执行超时（第{}次尝试）",
                instance.attempt_count
            );
            record.outcome = AttemptOutcome::TimedOut;
            record.error = Some(message.clone());
            retry_or_fail(env, instance, &message, &record, finished_at).await
        }
    };

    match written {
        Ok(()) => {}
        Err(SchedulerError::LeaseLost { .. }) => {
            env.metrics.record_lease_lost(task);
            warn!(instance_id = %instance.id, "写入结果时发现租约已丢失，结果被丢弃");
        }
        Err(e) => {
            TaskTracer::record_error(&e);
            error!(instance_id = %instance.id, "写入执行结果失败，租约到期后将被重新认领: {}", e);
        }
    }
}

async fn retry_or_fail(
    env: &ExecutionEnv,
    instance: &TaskInstance,
    message: &str,
    record: &AttemptRecord,
    failed_at: DateTime<Utc>,
) -> SchedulerResult<()> {
    let task = instance.task_name.as_str();
    let node_id = env.settings.node_id.as_str();

    match next_attempt(&instance.retry_policy, instance.attempt_count) {
        RetryDecision::Retry(delay) => {
            let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
            let next_eta = failed_at
                .checked_add_signed(delay)
                .unwrap_or(failed_at)
                .max(instance.eta);
            env.metrics.record_retry(task, instance.attempt_count);
            info!(
                instance_id = %instance.id,
                attempt = instance.attempt_count,
                next_eta = %next_eta,
                "实例执行失败，已安排重试: {}",
                message
            );
            env.store
                .mark_failed(instance.id, node_id, message, Some(next_eta), Some(record))
                .await
        }
        RetryDecision::Exhausted => {
            let exhausted = SchedulerError::RetriesExhausted {
                id: instance.id,
                attempts: instance.attempt_count,
            };
            env.metrics.record_failed(task, "exhausted");
            warn!(instance_id = %instance.id, "{}: {}", exhausted, message);
            env.store
                .mark_failed(instance.id, node_id, message, None, Some(record))
                .await
        }
    }
}
