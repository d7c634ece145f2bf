use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use taskman_core::{Clock, LeaseToken, LockProvider, SchedulerResult, SystemClock};

use super::{expires_at, new_token};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_locks (
    lock_key VARCHAR(512) PRIMARY KEY,
    token VARCHAR(64) NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
)
"#;

/// PostgreSQL锁
///
/// 加锁是一条条件upsert：键不存在时插入，已存在但过期时覆盖，
/// 行锁保证同一个键的并发请求至多一个成功。
pub struct PostgresLockProvider {
    pool: PgPool,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl PostgresLockProvider {
    pub fn new(pool: PgPool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(pool: PgPool, key_prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            clock,
        }
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        debug!("task_locks表已就绪");
        Ok(())
    }
}

#[async_trait]
impl LockProvider for PostgresLockProvider {
    async fn acquire(&self, key: &str, ttl: Duration) -> SchedulerResult<Option<LeaseToken>> {
        let now = self.clock.now();
        let full_key = format!("{}{}", self.key_prefix, key);
        let token = new_token();
        let expires = expires_at(now, ttl)?;

        let acquired = sqlx::query(
            r#"
            INSERT INTO task_locks (lock_key, token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE
            SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
            WHERE task_locks.expires_at < $4
            "#,
        )
        .bind(&full_key)
        .bind(&token)
        .bind(expires)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if acquired.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(LeaseToken {
            key: full_key,
            token,
            expires_at: expires,
        }))
    }

    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> SchedulerResult<bool> {
        let now = self.clock.now();
        let renewed = sqlx::query(
            "UPDATE task_locks SET expires_at = $1 WHERE lock_key = $2 AND token = $3 AND expires_at > $4",
        )
        .bind(expires_at(now, ttl)?)
        .bind(&token.key)
        .bind(&token.token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(renewed.rows_affected() == 1)
    }

    async fn release(&self, token: &LeaseToken) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM task_locks WHERE lock_key = $1 AND token = $2")
            .bind(&token.key)
            .bind(&token.token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
