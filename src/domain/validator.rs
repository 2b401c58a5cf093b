//! 验证者（见证人）领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::bridge_transaction::{amount_serde, Amount};

/// 验证者，address 即其 ed25519 公钥（hex 或 base58）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    pub address: String,
    pub network: String,
    #[serde(with = "amount_serde")]
    #[schema(value_type = String)]
    pub stake: Amount,
    pub active: bool,
    pub reputation: i64,
    pub total_attestations: u64,
    pub successful_attestations: u64,
    pub last_seen_at: DateTime<Utc>,
}

impl Validator {
    pub fn new(
        address: impl Into<String>,
        network: impl Into<String>,
        stake: Amount,
        reputation: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            address: address.into(),
            network: network.into(),
            stake,
            active: true,
            reputation,
            total_attestations: 0,
            successful_attestations: 0,
            last_seen_at: now,
        }
    }
}
