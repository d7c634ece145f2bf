pub mod mapping;
pub mod postgres;
pub mod sqlite;

use std::time::Duration;

use taskman_core::config::DatabaseConfig;
use taskman_core::SchedulerResult;

pub use postgres::PostgresTaskStore;
pub use sqlite::SqliteTaskStore;

/// Create a PostgreSQL pool from configuration
pub async fn connect_postgres(config: &DatabaseConfig) -> SchedulerResult<sqlx::PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connection_timeout())
        .idle_timeout(config.idle_timeout())
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.url)
        .await?;
    Ok(pool)
}

/// Create a SQLite pool from configuration
///
/// 内存数据库每个连接各自独立，因此 `:memory:` 地址强制使用单连接。
pub async fn connect_sqlite(config: &DatabaseConfig) -> SchedulerResult<sqlx::SqlitePool> {
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections
    };
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(config.min_connections.min(max_connections))
        .acquire_timeout(config.connection_timeout())
        .idle_timeout(config.idle_timeout())
        .connect(&config.url)
        .await?;
    Ok(pool)
}
