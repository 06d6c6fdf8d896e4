use chrono::{DateTime, Utc};
use std::time::Duration;
use tablefix_core::config::models::WorkerConfig;

/// 任务级重试的指数退避
///
/// 已执行 `k` 次后，下一次尝试前等待 `base × 2^k`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
}

const MAX_EXPONENT: u32 = 16;

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(Duration::from_millis(config.retry_base_delay_ms))
    }

    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.clamp(0, MAX_EXPONENT as i32) as u32;
        self.base_delay.saturating_mul(2u32.pow(exponent))
    }

    pub fn next_retry_at(&self, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff(attempts))
            .unwrap_or_else(|_| chrono::Duration::zero());
        now + delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        for k in 0..6 {
            assert_eq!(
                policy.backoff(k),
                Duration::from_millis(5000 * 2u64.pow(k as u32))
            );
        }
    }

    #[test]
    fn test_next_retry_at_offsets_now() {
        let policy = RetryPolicy::new(Duration::from_millis(5000));
        let now = Utc::now();
        assert_eq!(
            policy.next_retry_at(2, now) - now,
            chrono::Duration::milliseconds(20_000)
        );
    }

    #[test]
    fn test_exponent_is_bounded() {
        let policy = RetryPolicy::new(Duration::from_millis(1));
        assert_eq!(policy.backoff(-3), Duration::from_millis(1));
        assert_eq!(policy.backoff(1000), policy.backoff(16));
    }
}
