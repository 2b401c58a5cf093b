//! 跨链转账领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::transaction_status::TransferStatus;

/// 链上最小单位金额（整数，无浮点）
pub type Amount = u128;

/// 金额在线上以十进制字符串传输；反序列化同时接受 JSON 整数
pub mod amount_serde {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::Amount;

    pub fn serialize<S: Serializer>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text
                .trim()
                .parse::<Amount>()
                .map_err(|_| D::Error::custom(format!("invalid amount '{text}'"))),
            Raw::Number(n) => Ok(n as Amount),
        }
    }
}

/// 验证者签名记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub validator_id: String,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

/// 用户发起的转账请求（准入前）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub source_network: String,
    pub dest_network: String,
    pub source_address: String,
    pub dest_address: String,
    #[serde(with = "amount_serde")]
    #[schema(value_type = String, example = "1000000")]
    pub amount: Amount,
    #[serde(default)]
    pub express: bool,
}

/// 跨链转账记录（状态以存储为准）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeTransaction {
    pub id: Uuid,
    pub source_network: String,
    pub dest_network: String,
    pub source_address: String,
    pub dest_address: String,
    #[serde(with = "amount_serde")]
    #[schema(value_type = String)]
    pub amount: Amount,
    /// 创建时计算，之后不再重算
    #[serde(with = "amount_serde")]
    #[schema(value_type = String)]
    pub fee_amount: Amount,
    pub express: bool,
    pub status: TransferStatus,
    pub source_tx_ref: Option<String>,
    pub dest_tx_ref: Option<String>,
    pub confirmations: u64,
    pub attestations: Vec<Attestation>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// 写入版本号（审计元数据，CAS 使用）
    #[serde(skip)]
    pub revision: u64,
}

impl BridgeTransaction {
    /// 由已通过校验的请求创建 pending 记录
    pub fn admit(request: TransferRequest, fee_amount: Amount, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_network: request.source_network,
            dest_network: request.dest_network,
            source_address: request.source_address,
            dest_address: request.dest_address,
            amount: request.amount,
            fee_amount,
            express: request.express,
            status: TransferStatus::Pending,
            source_tx_ref: None,
            dest_tx_ref: None,
            confirmations: 0,
            attestations: Vec::new(),
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 目标链实际到账金额
    pub fn net_amount(&self) -> Amount {
        self.amount.saturating_sub(self.fee_amount)
    }

    pub fn has_attestation_from(&self, validator_id: &str) -> bool {
        self.attestations
            .iter()
            .any(|a| a.validator_id == validator_id)
    }
}
