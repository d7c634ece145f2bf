use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use taskman_core::{Clock, LeaseToken, LockProvider, SchedulerResult, SystemClock};

use super::{expires_at, new_token};

struct Entry {
    token: String,
    expires_at: DateTime<Utc>,
}

/// 进程内锁
pub struct InMemoryLockProvider {
    entries: Mutex<HashMap<String, Entry>>,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryLockProvider {
    fn default() -> Self {
        Self::new("")
    }
}

impl InMemoryLockProvider {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self::with_clock(key_prefix, Arc::new(SystemClock))
    }

    pub fn with_clock(key_prefix: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            key_prefix: key_prefix.into(),
            clock,
        }
    }

    /// 当前未过期的锁数量
    pub async fn held(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire(&self, key: &str, ttl: Duration) -> SchedulerResult<Option<LeaseToken>> {
        let now = self.clock.now();
        let full_key = format!("{}{}", self.key_prefix, key);
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(&full_key) {
            if entry.expires_at > now {
                debug!(key = %full_key, "锁已被持有");
                return Ok(None);
            }
        }

        let token = LeaseToken {
            key: full_key.clone(),
            token: new_token(),
            expires_at: expires_at(now, ttl)?,
        };
        entries.insert(
            full_key,
            Entry {
                token: token.token.clone(),
                expires_at: token.expires_at,
            },
        );
        Ok(Some(token))
    }

    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> SchedulerResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&token.key) {
            Some(entry) if entry.token == token.token && entry.expires_at > now => {
                entry.expires_at = expires_at(now, ttl)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, token: &LeaseToken) -> SchedulerResult<()> {
        let mut entries = self.entries.lock().await;
        if entries
            .get(&token.key)
            .is_some_and(|entry| entry.token == token.token)
        {
            entries.remove(&token.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use taskman_core::ManualClock;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_expiry() {
        let clock = clock();
        let locks = InMemoryLockProvider::with_clock("lock:", clock.clone());
        let ttl = Duration::from_secs(10);

        let first = locks.acquire("job", ttl).await.unwrap().unwrap();
        assert_eq!(first.key, "lock:job");
        assert!(locks.acquire("job", ttl).await.unwrap().is_none());
        assert!(locks.acquire("other", ttl).await.unwrap().is_some());

        clock.advance(chrono::Duration::seconds(11));
        let second = locks.acquire("job", ttl).await.unwrap().unwrap();
        assert_ne!(first.token, second.token);
        assert!(!locks.renew(&first, ttl).await.unwrap());
        assert!(locks.renew(&second, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let clock = clock();
        let locks = InMemoryLockProvider::with_clock("", clock.clone());
        let ttl = Duration::from_secs(10);

        let stale = locks.acquire("job", ttl).await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(11));
        let current = locks.acquire("job", ttl).await.unwrap().unwrap();

        locks.release(&stale).await.unwrap();
        assert_eq!(locks.held().await, 1);
        locks.release(&current).await.unwrap();
        assert_eq!(locks.held().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let locks = Arc::new(InMemoryLockProvider::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.acquire("shared", Duration::from_secs(30)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
