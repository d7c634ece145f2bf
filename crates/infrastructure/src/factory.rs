//! 根据配置装配任务存储和锁服务

use std::sync::Arc;

use tracing::info;

use taskman_core::config::{DatabaseConfig, LockBackend, LockConfig, StoreBackend};
use taskman_core::{Clock, LockProvider, SchedulerError, SchedulerResult, TaskStore};

use crate::database::{connect_postgres, connect_sqlite, PostgresTaskStore, SqliteTaskStore};
use crate::in_memory_store::InMemoryTaskStore;
use crate::lock::{InMemoryLockProvider, PostgresLockProvider, RedisLockProvider};

/// 装配完成的存储后端
pub struct Backends {
    pub store: Arc<dyn TaskStore>,
    pub lock: Arc<dyn LockProvider>,
}

pub struct BackendFactory;

impl BackendFactory {
    pub async fn create(
        database: &DatabaseConfig,
        lock: &LockConfig,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Backends> {
        let mut shared_pg_pool = None;

        let store: Arc<dyn TaskStore> = match database.backend {
            StoreBackend::Memory => {
                info!("使用内存任务存储");
                Arc::new(InMemoryTaskStore::with_clock(clock.clone()))
            }
            StoreBackend::Sqlite => {
                info!("连接SQLite任务存储: {}", database.url);
                let pool = connect_sqlite(database).await?;
                let store = SqliteTaskStore::with_clock(pool, clock.clone());
                if database.auto_migrate {
                    store.migrate().await?;
                }
                Arc::new(store)
            }
            StoreBackend::Postgres => {
                info!("连接PostgreSQL任务存储");
                let pool = connect_postgres(database).await?;
                shared_pg_pool = Some(pool.clone());
                let store = PostgresTaskStore::with_clock(pool, clock.clone());
                if database.auto_migrate {
                    store.migrate().await?;
                }
                Arc::new(store)
            }
        };

        let lock: Arc<dyn LockProvider> = match lock.backend {
            LockBackend::Memory => {
                info!("使用进程内锁服务");
                Arc::new(InMemoryLockProvider::with_clock(
                    lock.key_prefix.clone(),
                    clock,
                ))
            }
            LockBackend::Redis => {
                let url = lock.url.as_deref().ok_or_else(|| {
                    SchedulerError::Configuration("Redis锁需要配置url".to_string())
                })?;
                info!("连接Redis锁服务");
                Arc::new(RedisLockProvider::connect(url, lock.key_prefix.clone()).await?)
            }
            LockBackend::Postgres => {
                let pool = match (&lock.url, shared_pg_pool) {
                    (Some(url), _) => {
                        let config = DatabaseConfig {
                            url: url.clone(),
                            ..database.clone()
                        };
                        connect_postgres(&config).await?
                    }
                    (None, Some(pool)) => pool,
                    (None, None) => {
                        return Err(SchedulerError::Configuration(
                            "PostgreSQL锁需要配置url或使用PostgreSQL任务存储".to_string(),
                        ))
                    }
                };
                info!("使用PostgreSQL锁服务");
                let provider =
                    PostgresLockProvider::with_clock(pool, lock.key_prefix.clone(), clock);
                provider.migrate().await?;
                Arc::new(provider)
            }
        };

        Ok(Backends { store, lock })
    }
}
