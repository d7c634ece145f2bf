use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 退避方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

/// 重试策略
///
/// 附加到任务定义或单次调度调用上后不再修改，并随实例一起持久化，
/// 保证任何节点对同一实例使用同一策略。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// 最大尝试次数（包含首次执行）
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    /// 基础重试间隔（毫秒）
    pub base_interval_ms: u64,
    /// 重试间隔上限（毫秒）
    #[serde(default)]
    pub max_interval_ms: Option<u64>,
    /// 随机抖动范围（0.0-1.0）
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_interval_ms: 1_000,
            max_interval_ms: Some(300_000),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Fixed,
            base_interval_ms: interval.as_millis() as u64,
            max_interval_ms: None,
            jitter_factor: 0.0,
        }
    }

    pub fn linear(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Linear,
            base_interval_ms: base.as_millis() as u64,
            max_interval_ms: None,
            jitter_factor: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, cap: Option<Duration>) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Exponential,
            base_interval_ms: base.as_millis() as u64,
            max_interval_ms: cap.map(|c| c.as_millis() as u64),
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts必须大于0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("jitter_factor必须在0.0到1.0之间".to_string());
        }
        if let Some(cap) = self.max_interval_ms {
            if cap < self.base_interval_ms {
                return Err("max_interval_ms不能小于base_interval_ms".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::fixed(0, Duration::from_secs(1)).validate().is_err());
        assert!(RetryPolicy::default().with_jitter(1.5).validate().is_err());
        let inverted = RetryPolicy::exponential(3, Duration::from_secs(10), Some(Duration::from_secs(1)));
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_policy_serde_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts":5,"backoff":"linear","base_interval_ms":200}"#)
                .unwrap();
        assert_eq!(policy.backoff, BackoffKind::Linear);
        assert_eq!(policy.max_interval_ms, None);
        assert_eq!(policy.jitter_factor, 0.0);
    }
}
