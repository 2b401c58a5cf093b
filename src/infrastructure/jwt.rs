//! 管理接口 JWT（HS256）签发与验证

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::BridgeError;

pub const ADMIN_ROLE: &str = "admin";

/// 管理员 Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,  // 操作员标识
    pub role: String, // 仅 "admin" 可调用管理接口
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

impl AdminClaims {
    pub fn new(operator: impl Into<String>, role: impl Into<String>, expires_in_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            sub: operator.into(),
            role: role.into(),
            exp: (now + Duration::seconds(expires_in_secs)).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

/// 签发管理员 token（运维工具与测试使用）
pub fn issue_token(secret: &str, claims: &AdminClaims) -> Result<String, BridgeError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| BridgeError::Unauthorized(format!("failed to sign token: {e}")))
}

/// 验证 token 签名与过期时间
pub fn verify_token(secret: &str, token: &str) -> Result<AdminClaims, BridgeError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| BridgeError::Unauthorized(format!("invalid token: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_issue_and_verify() {
        let token = issue_token(SECRET, &AdminClaims::new("ops-1", ADMIN_ROLE, 60)).unwrap();
        let claims = verify_token(SECRET, &token).unwrap();
        assert_eq!(claims.sub, "ops-1");
        assert!(claims.is_admin());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token(SECRET, &AdminClaims::new("ops-1", ADMIN_ROLE, 60)).unwrap();
        assert!(verify_token("another-secret-another-secret-xx", &token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = issue_token(SECRET, &AdminClaims::new("ops-1", ADMIN_ROLE, -600)).unwrap();
        assert!(verify_token(SECRET, &token).is_err());
    }
}
