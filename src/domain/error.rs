//! 跨链桥错误分类
//! 校验期错误同步返回调用方；执行期错误写入 lastError 并驱动状态转换

use thiserror::Error;

/// 桥接核心错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// 输入非法，准入阶段拒绝，不重试
    #[error("validation failed: {0}")]
    Validation(String),

    /// 日限额/全局限额超出，仅在准入阶段出现
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// 链适配器超时或RPC错误，按退避重试
    #[error("transient adapter failure: {0}")]
    TransientAdapter(String),

    /// 重试耗尽或适配器永久拒绝
    #[error("terminal failure: {0}")]
    Terminal(String),

    /// 活跃质押不足，永远无法达到法定人数
    #[error("consensus unreachable: {0}")]
    Consensus(String),

    /// 源链确认数回退超出容忍度，需人工复核
    #[error("reorg detected: {0}")]
    Reorg(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// CAS 失败、非法状态转换或终态记录
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BridgeError {
    /// 可重试的错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientAdapter(_))
    }

    /// 指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::RateLimit(_) => "rate_limit",
            Self::TransientAdapter(_) => "transient_adapter",
            Self::Terminal(_) => "terminal",
            Self::Consensus(_) => "consensus",
            Self::Reorg(_) => "reorg",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redis::RedisError> for BridgeError {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage(format!("redis: {err}"))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("json: {err}"))
    }
}

/// 链适配器错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("adapter call timed out after {0}ms")]
    Timeout(u64),

    #[error("rpc error: {0}")]
    Rpc(String),

    /// 链上永久拒绝（非法参数、余额不足等），不重试
    #[error("rejected by chain: {0}")]
    Rejected(String),
}

impl From<AdapterError> for BridgeError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Timeout(_) | AdapterError::Rpc(_) => {
                BridgeError::TransientAdapter(err.to_string())
            }
            AdapterError::Rejected(_) => BridgeError::Terminal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_classification() {
        assert!(BridgeError::from(AdapterError::Timeout(500)).is_transient());
        assert!(BridgeError::from(AdapterError::Rpc("502".into())).is_transient());
        assert!(matches!(
            BridgeError::from(AdapterError::Rejected("bad params".into())),
            BridgeError::Terminal(_)
        ));
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(BridgeError::RateLimit("x".into()).kind(), "rate_limit");
        assert_eq!(BridgeError::Reorg("x".into()).kind(), "reorg");
    }
}
