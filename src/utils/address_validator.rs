//! 地址验证模块
//!
//! 按网络的地址格式校验用户提交的源/目标地址

use sha2::{Digest, Sha256};

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// 地址验证器
pub struct AddressValidator;

impl AddressValidator {
    /// 验证EVM地址（支持EIP-55 Checksum）
    pub fn validate_evm(address: &str) -> bool {
        let Some(hex_part) = address.strip_prefix("0x") else {
            return false;
        };
        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }

        // 全小写或全大写不带 checksum
        let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
        if has_upper && has_lower {
            return Self::verify_eip55_checksum(hex_part);
        }
        true
    }

    /// https://eips.ethereum.org/EIPS/eip-55
    fn verify_eip55_checksum(hex_part: &str) -> bool {
        use sha3::Keccak256;

        let hash = Keccak256::digest(hex_part.to_lowercase().as_bytes());

        hex_part.chars().enumerate().all(|(i, ch)| {
            if !ch.is_ascii_alphabetic() {
                return true;
            }
            let byte = hash[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            ch.is_ascii_uppercase() == (nibble >= 8)
        })
    }

    /// 验证Solana地址（Base58编码，32字节公钥）
    pub fn validate_solana(address: &str) -> bool {
        if address.len() < 32 || address.len() > 44 {
            return false;
        }
        matches!(bs58::decode(address).into_vec(), Ok(bytes) if bytes.len() == 32)
    }

    /// 验证Bitcoin地址：P2PKH/P2SH（Base58Check）或 SegWit（bech32/bech32m）
    pub fn validate_bitcoin(address: &str) -> bool {
        let lower = address.to_lowercase();
        if lower.starts_with("bc1") || lower.starts_with("tb1") {
            return bech32::segwit::decode(address).is_ok();
        }
        if address.starts_with('1') || address.starts_with('3') {
            return Self::validate_base58check(address);
        }
        false
    }

    /// 版本字节 + 20字节哈希 + 4字节双SHA256校验和
    fn validate_base58check(address: &str) -> bool {
        if address.len() < 26 || address.len() > 35 {
            return false;
        }
        if !address.chars().all(|c| BASE58_ALPHABET.contains(c)) {
            return false;
        }
        let Ok(decoded) = bs58::decode(address).into_vec() else {
            return false;
        };
        if decoded.len() != 25 {
            return false;
        }

        let (payload, checksum) = decoded.split_at(21);
        let digest = Sha256::digest(Sha256::digest(payload));
        &digest[..4] == checksum
    }

    /// 验证TON地址
    /// - User-friendly: EQ.../UQ...（48个字符，base64url）
    /// - Raw: workchain:hex64
    pub fn validate_ton(address: &str) -> bool {
        if (address.starts_with("EQ") || address.starts_with("UQ")) && address.len() == 48 {
            return address
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '-' | '_'));
        }

        match address.split_once(':') {
            Some((workchain, account)) => {
                workchain.parse::<i32>().is_ok()
                    && account.len() == 64
                    && account.chars().all(|c| c.is_ascii_hexdigit())
            }
            None => false,
        }
    }
}
