use serde::{Deserialize, Serialize};

use crate::models::RetryPolicy;

/// 通过配置文件声明的任务定义
///
/// ```toml
/// [[tasks]]
/// name = "nightly_report"
/// handler = "shell"
/// cron = "0 2 * * *"
/// params = { command = "scripts/report.sh", args = ["--daily"] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    pub name: String,
    /// 内置处理器类型: shell | http
    pub handler: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub catch_up: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// 处理器参数
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    /// 周期实例使用的负载
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl TaskConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow::anyhow!("任务名称不能为空"));
        }

        if !matches!(self.handler.as_str(), "shell" | "http") {
            return Err(anyhow::anyhow!(
                "任务 {} 使用了不支持的处理器类型: {}",
                self.name,
                self.handler
            ));
        }

        if self.timeout_seconds == Some(0) {
            return Err(anyhow::anyhow!("任务 {} 的超时时间必须大于0", self.name));
        }

        if self.max_concurrency == Some(0) {
            return Err(anyhow::anyhow!("任务 {} 的并发上限必须大于0", self.name));
        }

        if let Some(retry) = &self.retry {
            retry
                .validate()
                .map_err(|e| anyhow::anyhow!("任务 {} 的重试策略无效: {e}", self.name))?;
        }

        Ok(())
    }
}
