use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::debug;

use taskman_core::{LeaseToken, LockProvider, SchedulerError, SchedulerResult};

use super::{expires_at, new_token};

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis锁
///
/// 加锁使用 `SET key token NX PX ttl`；续约和释放通过Lua脚本先比较令牌，
/// 避免操作已被其他节点重新获取的锁。
pub struct RedisLockProvider {
    connection: ConnectionManager,
    key_prefix: String,
    renew_script: Script,
    release_script: Script,
}

fn lock_error(e: redis::RedisError) -> SchedulerError {
    SchedulerError::LockUnavailable(e.to_string())
}

impl RedisLockProvider {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> SchedulerResult<Self> {
        let client = Client::open(url).map_err(|e| {
            SchedulerError::Configuration(format!("Failed to create Redis client: {e}"))
        })?;
        let connection = ConnectionManager::new(client).await.map_err(lock_error)?;
        debug!("Successfully connected to Redis lock backend");
        Ok(Self::new(connection, key_prefix))
    }

    pub fn new(connection: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.into(),
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn acquire(&self, key: &str, ttl: Duration) -> SchedulerResult<Option<LeaseToken>> {
        let full_key = format!("{}{}", self.key_prefix, key);
        let token = new_token();
        let mut conn = self.connection.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(lock_error)?;

        match reply {
            Some(_) => Ok(Some(LeaseToken {
                key: full_key,
                token,
                expires_at: expires_at(Utc::now(), ttl)?,
            })),
            None => Ok(None),
        }
    }

    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> SchedulerResult<bool> {
        let mut conn = self.connection.clone();
        let renewed: i64 = self
            .renew_script
            .key(&token.key)
            .arg(&token.token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(renewed == 1)
    }

    async fn release(&self, token: &LeaseToken) -> SchedulerResult<()> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .release_script
            .key(&token.key)
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::redis::Redis;

    #[tokio::test]
    #[ignore] // 需要Docker环境
    async fn test_redis_lock_lifecycle() {
        let container = Redis::default().start().await.unwrap();
        let port = container.get_host_port_ipv4(6379).await.unwrap();
        let url = format!("redis://127.0.0.1:{port}");

        let node_a = RedisLockProvider::connect(&url, "taskman:lock:").await.unwrap();
        let node_b = RedisLockProvider::connect(&url, "taskman:lock:").await.unwrap();
        let ttl = Duration::from_secs(5);

        let token = node_a.acquire("job", ttl).await.unwrap().unwrap();
        assert!(node_b.acquire("job", ttl).await.unwrap().is_none());
        assert!(node_a.renew(&token, ttl).await.unwrap());

        let forged = LeaseToken {
            token: "someone-else".to_string(),
            ..token.clone()
        };
        assert!(!node_b.renew(&forged, ttl).await.unwrap());
        node_b.release(&forged).await.unwrap();
        assert!(node_b.acquire("job", ttl).await.unwrap().is_none());

        node_a.release(&token).await.unwrap();
        assert!(node_b.acquire("job", ttl).await.unwrap().is_some());
    }
}
