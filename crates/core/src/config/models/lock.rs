use serde::{Deserialize, Serialize};

/// 锁服务后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    Memory,
    Redis,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    /// Redis或PostgreSQL连接地址，PostgreSQL后端为空时复用数据库连接
    pub url: Option<String>,
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Memory,
            url: None,
            key_prefix: "taskman:lock:".to_string(),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == LockBackend::Redis {
            match &self.url {
                Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {}
                Some(_) => return Err(anyhow::anyhow!("Redis锁地址必须以redis://开头")),
                None => return Err(anyhow::anyhow!("Redis锁需要配置url")),
            }
        }

        if self.key_prefix.is_empty() {
            return Err(anyhow::anyhow!("锁键前缀不能为空"));
        }

        Ok(())
    }
}
