//! 投递重试策略
//!
//! 提供指数退避重试策略，约束单个任务的投递尝试次数与重试间隔。
//! 策略本身只做计算，不负责执行——何时重投、何时放弃由任务队列决定。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

/// 重试策略配置
///
/// 使用指数退避避免重试风暴：首次失败等 10 秒，第 2 次等 20 秒，
/// 第 3 次等 40 秒...直到达到最大间隔或尝试次数耗尽。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次投递）
    pub max_attempts: u32,
    /// 首次重试前的等待时间
    pub base_delay: Duration,
    /// 退避时间上限，防止等待过长
    pub max_delay: Duration,
    /// 每次重试的退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 默认策略：最多 3 次尝试，退避基数 10 秒，上限 10 分钟，倍数 2.0
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 计算第 N 次失败后的重投等待时间（failed_attempts 从 1 开始）
    ///
    /// 公式: base_delay * multiplier^(failed_attempts - 1)，结果不超过 max_delay。
    /// 使用 f64 运算后再转回 Duration，接受微秒级精度损失——
    /// 对秒级退避场景而言完全可接受。
    pub fn delay_after_attempt(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(exponent as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 已执行 attempts 次后是否耗尽尝试次数
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_seconds),
            max_delay: Duration::from_secs(config.max_delay_seconds),
            multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(10));
        assert_eq!(policy.max_delay, Duration::from_secs(600));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let policy = RetryPolicy::default();

        // 第 1 次失败后: 10s * 2^0 = 10s
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(10));
        // 第 2 次失败后: 10s * 2^1 = 20s
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(20));
        // 第 3 次失败后: 10s * 2^2 = 40s
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(40));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(40));
        // 10s * 2^3 = 80s -> 受限于 max_delay -> 60s
        assert_eq!(policy.delay_after_attempt(4), Duration::from_secs(60));
        assert_eq!(policy.delay_after_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_is_exhausted() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(1));
        assert!(!policy.is_exhausted(2));
        // 第 3 次尝试完成后耗尽
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn test_from_retry_config() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_seconds: 2,
            max_delay_seconds: 30,
        };
        let policy = RetryPolicy::from(&config);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
