// 交易重试和退避策略
//
// - 瞬时适配器错误累加 retryCount，按指数退避等待下次处理
// - retryCount 超过上限即失败
// - 状态前进时清零

use std::time::Duration;

use crate::config::BridgeConfig;

/// 交易重试配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始退避（毫秒）
    pub initial_delay_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: u64,
    /// 退避上限（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2,
            max_delay_ms: 60_000,
        }
    }
}

impl From<&BridgeConfig> for RetryConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            max_retries: config.max_retry_attempts,
            initial_delay_ms: config.initial_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl RetryConfig {
    /// 第 n 次失败后的等待：initial * multiplier^(n-1)，不超过上限
    pub fn delay_after(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = self
            .backoff_multiplier
            .max(1)
            .checked_pow(retry_count - 1)
            .unwrap_or(u64::MAX);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }
}
