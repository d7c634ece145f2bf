use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SchedulerResult;

/// 一次成功加锁的凭证
///
/// `token` 是加锁时生成的随机值，续约和释放都要求凭证匹配，
/// 因此过期后被其他节点重新获取的锁不会被误删。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// 分布式锁服务
///
/// 对同一个key的 `acquire` 必须是线性一致的：来自不同节点的并发请求至多一个成功。
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// 非阻塞地尝试获取锁，已被持有时返回 `None`
    async fn acquire(&self, key: &str, ttl: Duration) -> SchedulerResult<Option<LeaseToken>>;

    /// 续约，锁已过期或被他人持有时返回 `false`
    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> SchedulerResult<bool>;

    /// 尽力释放，调用方只记录失败
    async fn release(&self, token: &LeaseToken) -> SchedulerResult<()>;
}
