use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 任务存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// 单进程内存存储
    Memory,
    /// 嵌入式单节点存储
    Sqlite,
    /// 多节点共享存储
    Postgres,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    /// 启动时自动建表
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            url: "sqlite://taskman.db?mode=rwc".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Validate database configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.backend {
            StoreBackend::Memory => return Ok(()),
            StoreBackend::Sqlite => {
                if !self.url.starts_with("sqlite:") {
                    return Err(anyhow::anyhow!("SQLite存储的URL必须以sqlite:开头"));
                }
            }
            StoreBackend::Postgres => {
                if !self.url.starts_with("postgresql://") && !self.url.starts_with("postgres://") {
                    return Err(anyhow::anyhow!("数据库URL必须是PostgreSQL格式"));
                }
            }
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        if self.min_connections > self.max_connections {
            return Err(anyhow::anyhow!("最小连接数不能大于最大连接数"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        Ok(())
    }
}
