//! 网络描述
//!
//! 每条支持的链一份，加载后不可变，由 NetworkRegistry 持有

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::utils::address_validator::AddressValidator;

/// 地址编码格式（决定地址校验规则）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AddressFormat {
    /// 0x + 40位十六进制，混合大小写时校验 EIP-55
    Evm,
    /// Base58，解码后32字节
    Solana,
    /// Base58Check legacy 或 bech32 segwit
    Bitcoin,
    /// raw `wc:hex` 或 48位 user-friendly
    Ton,
}

impl AddressFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evm => "evm",
            Self::Solana => "solana",
            Self::Bitcoin => "bitcoin",
            Self::Ton => "ton",
        }
    }

    /// 校验地址语法
    pub fn validate(&self, address: &str) -> bool {
        match self {
            Self::Evm => AddressValidator::validate_evm(address),
            Self::Solana => AddressValidator::validate_solana(address),
            Self::Bitcoin => AddressValidator::validate_bitcoin(address),
            Self::Ton => AddressValidator::validate_ton(address),
        }
    }
}

impl fmt::Display for AddressFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "evm" | "ethereum" | "hex" => Ok(Self::Evm),
            "solana" => Ok(Self::Solana),
            "bitcoin" | "btc" => Ok(Self::Bitcoin),
            "ton" => Ok(Self::Ton),
            other => Err(format!("unknown address format '{other}'")),
        }
    }
}

/// 链描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDescriptor {
    pub id: String,
    pub enabled: bool,
    pub required_confirmations: u64,
    pub fee_basis_points: u32,
    pub rpc_endpoint: String,
    /// 平均出块时间（用于预计耗时）
    pub block_time_secs: u64,
    pub address_format: AddressFormat,
}

impl NetworkDescriptor {
    pub fn validate_address(&self, address: &str) -> bool {
        self.address_format.validate(address)
    }

    /// 达到所需确认数的预计秒数
    pub fn confirmation_time_secs(&self) -> u64 {
        self.required_confirmations
            .saturating_mul(self.block_time_secs)
    }
}
