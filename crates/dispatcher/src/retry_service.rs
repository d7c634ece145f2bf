use std::time::Duration;

use taskman_core::{BackoffKind, RetryPolicy};

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 在给定延迟后重试
    Retry(Duration),
    /// 尝试次数已用尽，进入终态失败
    Exhausted,
}

/// 根据已完成的尝试次数计算下一次尝试
///
/// `attempt_count` 为包含本次在内的已尝试次数，达到 `max_attempts` 时返回 `Exhausted`。
pub fn next_attempt(policy: &RetryPolicy, attempt_count: u32) -> RetryDecision {
    if attempt_count >= policy.max_attempts {
        return RetryDecision::Exhausted;
    }
    RetryDecision::Retry(backoff_delay(policy, attempt_count))
}

/// 第 `attempt` 次失败后的退避时长，含抖动
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    apply_jitter(base_delay(policy, attempt), policy.jitter_factor)
}

/// 未加抖动的退避时长，已按上限截断
pub fn base_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let base = policy.base_interval_ms;

    let delay_ms = match policy.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::Linear => base.saturating_mul(u64::from(attempt)),
        BackoffKind::Exponential => match 2u64.checked_pow(attempt - 1) {
            Some(multiplier) => base.saturating_mul(multiplier),
            None => u64::MAX,
        },
    };

    let capped = match policy.max_interval_ms {
        Some(cap) => delay_ms.min(cap),
        None => delay_ms,
    };
    Duration::from_millis(capped)
}

fn apply_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let secs = delay.as_secs_f64();
    let jitter = secs * jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
    let jittered = (secs + jitter).max(0.0);
    Duration::try_from_secs_f64(jittered).unwrap_or(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_sequence_with_cap() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_secs(1), Some(Duration::from_secs(30)));
        let delays: Vec<u64> = (1..=6)
            .map(|n| match next_attempt(&policy, n) {
                RetryDecision::Retry(d) => d.as_secs(),
                RetryDecision::Exhausted => panic!("unexpected exhaustion at {n}"),
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
    }

    #[test]
    fn test_fixed_and_linear() {
        let fixed = RetryPolicy::fixed(5, Duration::from_secs(5));
        assert_eq!(base_delay(&fixed, 1), Duration::from_secs(5));
        assert_eq!(base_delay(&fixed, 4), Duration::from_secs(5));

        let linear = RetryPolicy::linear(5, Duration::from_millis(200));
        assert_eq!(base_delay(&linear, 1), Duration::from_millis(200));
        assert_eq!(base_delay(&linear, 3), Duration::from_millis(600));
    }

    #[test]
    fn test_exhausted_at_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        assert!(matches!(next_attempt(&policy, 2), RetryDecision::Retry(_)));
        assert_eq!(next_attempt(&policy, 3), RetryDecision::Exhausted);
        assert_eq!(next_attempt(&policy, 7), RetryDecision::Exhausted);
    }

    #[test]
    fn test_exponential_saturates_without_cap() {
        let policy = RetryPolicy::exponential(u32::MAX, Duration::from_secs(1), None);
        assert_eq!(base_delay(&policy, 200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(10)).with_jitter(0.1);
        for _ in 0..200 {
            let delay = backoff_delay(&policy, 1);
            assert!(delay >= Duration::from_secs(9), "{delay:?}");
            assert!(delay <= Duration::from_secs(11), "{delay:?}");
        }
    }
}
