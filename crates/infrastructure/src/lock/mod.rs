//! 分布式锁服务实现
//!
//! - [`InMemoryLockProvider`]：单进程模式，锁不跨节点
//! - [`RedisLockProvider`]：`SET NX PX` 加锁，Lua脚本比较令牌后续约或删除
//! - [`PostgresLockProvider`]：`task_locks` 表上的条件 upsert

pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::InMemoryLockProvider;
pub use postgres::PostgresLockProvider;
pub use redis::RedisLockProvider;

use chrono::{DateTime, Utc};
use std::time::Duration;

use taskman_core::{SchedulerError, SchedulerResult};

pub(crate) fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn expires_at(now: DateTime<Utc>, ttl: Duration) -> SchedulerResult<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| SchedulerError::Internal(format!("无效的锁时长: {e}")))?;
    Ok(now + ttl)
}
