//! 任务存储接口定义
//!
//! `TaskStore` 是节点之间唯一共享的持久化状态，负责：
//! - 新实例的持久化与幂等键去重
//! - 原子的"认领到期实例并加租约"操作
//! - 基于租约持有者的结果写入
//! - 周期任务的积压状态查询
//!
//! ## 所有权规则
//!
//! 所有会修改已认领实例的操作都携带 `owner` 参数，存储实现必须在同一原子步骤里
//! 校验 `status = LEASED AND lease_owner = owner`，校验失败时返回
//! [`SchedulerError::LeaseLost`](crate::SchedulerError::LeaseLost)。
//! 认领操作与所有权校验共同保证同一实例在任意时刻至多有一个执行者。
//!
//! ```rust,ignore
//! let claimed = store
//!     .claim_due("node-a", 32, clock.now(), Duration::from_secs(30))
//!     .await?;
//! for instance in claimed {
//!     // 执行完成后写回结果
//!     store.mark_succeeded(instance.id, "node-a", record).await?;
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{AttemptRecord, CronState, LeaseStatus, TaskInstance};
use crate::SchedulerResult;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 持久化新的 Pending 实例
    ///
    /// 幂等键已存在时返回 `DuplicateInstance`，其中携带已存在实例的ID。
    async fn insert(&self, instance: &TaskInstance) -> SchedulerResult<Uuid>;

    async fn get(&self, id: Uuid) -> SchedulerResult<Option<TaskInstance>>;

    async fn find_by_reference(&self, reference: &str) -> SchedulerResult<Vec<TaskInstance>>;

    /// 原子地认领至多 `limit` 个到期实例
    ///
    /// 选中 `eta <= now` 的 Pending 实例以及租约已过期的 Leased 实例，
    /// 将其置为 Leased、写入租约持有者和到期时间并将尝试次数加一。
    /// 租约过期且尝试次数已达上限的实例在同一步骤中直接置为 Failed。
    async fn claim_due(
        &self,
        owner: &str,
        limit: usize,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> SchedulerResult<Vec<TaskInstance>>;

    /// 延长租约，返回租约当前是否仍被持有
    async fn extend_lease(
        &self,
        id: Uuid,
        owner: &str,
        until: DateTime<Utc>,
    ) -> SchedulerResult<LeaseStatus>;

    /// 放弃未执行的认领，实例回到 Pending 且撤销本次尝试计数
    async fn release_lease(&self, id: Uuid, owner: &str) -> SchedulerResult<()>;

    async fn mark_succeeded(
        &self,
        id: Uuid,
        owner: &str,
        record: &AttemptRecord,
    ) -> SchedulerResult<()>;

    /// 记录失败
    ///
    /// `next_eta` 存在表示重试：实例回到 Pending 并推迟到 `next_eta`；
    /// 不存在表示终态失败。
    async fn mark_failed(
        &self,
        id: Uuid,
        owner: &str,
        error: &str,
        next_eta: Option<DateTime<Utc>>,
        record: Option<&AttemptRecord>,
    ) -> SchedulerResult<()>;

    /// 取消 Pending 或 Leased 实例，返回是否发生了状态变化
    async fn cancel(&self, id: Uuid) -> SchedulerResult<bool>;

    async fn cron_state(&self, task_name: &str) -> SchedulerResult<CronState>;

    async fn attempts(&self, id: Uuid) -> SchedulerResult<Vec<AttemptRecord>>;
}
