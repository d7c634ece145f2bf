//! 任务管理器基础设施层
//!
//! 提供任务存储（内存、SQLite、PostgreSQL）、分布式锁（内存、Redis、PostgreSQL）
//! 以及日志、指标和链路追踪的初始化。

pub mod database;
pub mod factory;
pub mod in_memory_store;
pub mod lock;
pub mod observability;

pub use database::{PostgresTaskStore, SqliteTaskStore};
pub use factory::{BackendFactory, Backends};
pub use in_memory_store::InMemoryTaskStore;
pub use lock::{InMemoryLockProvider, PostgresLockProvider, RedisLockProvider};
pub use observability::*;
