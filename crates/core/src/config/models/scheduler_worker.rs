use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::RetryPolicy;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 节点标识，为空时使用 主机名-随机后缀
    pub node_id: Option<String>,
    pub poll_interval_ms: u64,
    pub claim_batch_size: usize,
    pub lease_ttl_seconds: u64,
    /// 心跳间隔，为空时取租约时长的三分之一
    pub heartbeat_interval_ms: Option<u64>,
    /// 存储不可用时轮询退避的上限
    pub max_backoff_seconds: u64,
    pub default_timeout_seconds: u64,
    pub default_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_id: None,
            poll_interval_ms: 1_000,
            claim_batch_size: 32,
            lease_ttl_seconds: 30,
            heartbeat_interval_ms: None,
            max_backoff_seconds: 30,
            default_timeout_seconds: 300,
            default_retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.lease_ttl() / 3)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.claim_batch_size == 0 {
            return Err(anyhow::anyhow!("单次认领数量必须大于0"));
        }

        if self.lease_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("租约时长必须大于0"));
        }

        if self.heartbeat_interval().is_zero() {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.heartbeat_interval() >= self.lease_ttl() {
            return Err(anyhow::anyhow!("心跳间隔必须小于租约时长"));
        }

        if self.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("默认超时时间必须大于0"));
        }

        self.default_retry
            .validate()
            .map_err(|e| anyhow::anyhow!("默认重试策略无效: {e}"))?;

        Ok(())
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_in_flight: usize,
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            shutdown_grace_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_in_flight == 0 {
            return Err(anyhow::anyhow!("最大并发执行数必须大于0"));
        }

        Ok(())
    }
}
