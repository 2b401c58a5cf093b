//! 跨链转账状态定义
//! pending → locking → locked → attesting → releasing → completed，任一非终态可转 failed

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 跨链转账状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// 已准入，尚未发起锁定
    Pending,

    /// 锁定交易已提交（或正在提交）到源链
    Locking,

    /// 锁定交易已观测到，确认数累积中
    Locked,

    /// 确认数满足，收集验证者签名
    Attesting,

    /// 释放/铸造交易已提交到目标链
    Releasing,

    /// 释放交易已确认
    Completed,

    Failed,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 7] = [
        Self::Pending,
        Self::Locking,
        Self::Locked,
        Self::Attesting,
        Self::Releasing,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locking => "locking",
            Self::Locked => "locked",
            Self::Attesting => "attesting",
            Self::Releasing => "releasing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// 终态（不可再转换，也不可再修改）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// 下一个正常流程状态
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Locking),
            Self::Locking => Some(Self::Locked),
            Self::Locked => Some(Self::Attesting),
            Self::Attesting => Some(Self::Releasing),
            Self::Releasing => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    /// 验证状态转换合法性：只能前进一步，或从非终态进入 failed
    pub fn can_transition_to(&self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == Self::Failed || self.next() == Some(target)
    }

    /// 进度百分比（失败为0）
    pub fn progress(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Locking => 15,
            Self::Locked => 35,
            Self::Attesting => 60,
            Self::Releasing => 85,
            Self::Completed => 100,
            Self::Failed => 0,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown transfer status '{s}'"))
    }
}
