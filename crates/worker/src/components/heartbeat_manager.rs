use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use taskman_core::{Clock, LeaseStatus, LeaseToken, LockProvider, SchedulerResult, TaskStore};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// 心跳退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// 执行正常结束
    Stopped,
    /// 锁或存储租约已被他人获取，执行结果不得写回
    LeaseLost,
    /// 实例在执行期间被取消
    CancelRequested,
}

enum Beat {
    Held,
    Cancelled,
    Lost,
}

/// 与执行并行运行的租约续约
///
/// 每个间隔依次续约锁和存储租约。任意一方确认丢失时触发执行的取消令牌并退出；
/// 续约调用本身出错时只记录日志，直到距上次成功续约超过租约时长才视为丢失。
pub struct LeaseHeartbeat {
    store: Arc<dyn TaskStore>,
    lock: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
    instance_id: Uuid,
    owner: String,
    token: LeaseToken,
    lease_ttl: Duration,
    interval: Duration,
}

impl LeaseHeartbeat {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        lock: Arc<dyn LockProvider>,
        clock: Arc<dyn Clock>,
        instance_id: Uuid,
        owner: impl Into<String>,
        token: LeaseToken,
        lease_ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            lock,
            clock,
            instance_id,
            owner: owner.into(),
            token,
            lease_ttl,
            interval,
        }
    }

    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    /// 运行直到 `done` 触发或租约丢失
    pub async fn run(&self, execution: CancellationToken, done: CancellationToken) -> HeartbeatExit {
        let period = self.interval.max(MIN_INTERVAL);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_renewed = self.clock.now();

        loop {
            tokio::select! {
                biased;
                _ = done.cancelled() => return HeartbeatExit::Stopped,
                _ = ticker.tick() => {}
            }

            match self.beat().await {
                Ok(Beat::Held) => {
                    last_renewed = self.clock.now();
                    debug!(instance_id = %self.instance_id, "租约已续约");
                }
                Ok(Beat::Cancelled) => {
                    debug!(instance_id = %self.instance_id, "实例已被取消，通知处理器停止");
                    execution.cancel();
                    return HeartbeatExit::CancelRequested;
                }
                Ok(Beat::Lost) => {
                    warn!(instance_id = %self.instance_id, owner = %self.owner, "租约已丢失，放弃执行");
                    execution.cancel();
                    return HeartbeatExit::LeaseLost;
                }
                Err(e) => {
                    warn!(instance_id = %self.instance_id, "续约失败: {}", e);
                    if self.expired_since(last_renewed) {
                        warn!(instance_id = %self.instance_id, "超过租约时长未能续约，视为租约丢失");
                        execution.cancel();
                        return HeartbeatExit::LeaseLost;
                    }
                }
            }
        }
    }

    fn expired_since(&self, last_renewed: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.lease_ttl) {
            Ok(ttl) => self.clock.now() > last_renewed + ttl,
            Err(_) => false,
        }
    }

    async fn beat(&self) -> SchedulerResult<Beat> {
        if !self.lock.renew(&self.token, self.lease_ttl).await? {
            return Ok(Beat::Lost);
        }

        let ttl = chrono::Duration::from_std(self.lease_ttl)
            .map_err(|e| taskman_core::SchedulerError::Internal(e.to_string()))?;
        let until = self.clock.now() + ttl;
        Ok(
            match self
                .store
                .extend_lease(self.instance_id, &self.owner, until)
                .await?
            {
                LeaseStatus::Held => Beat::Held,
                LeaseStatus::Cancelled => Beat::Cancelled,
                LeaseStatus::Lost => Beat::Lost,
            },
        )
    }
}
