//! 管理接口鉴权
//! Authorization: Bearer <JWT>，HS256 签名且 role == "admin"

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::{
    api::middleware::trace_id::TraceId,
    app_state::AppState,
    error::AppError,
    infrastructure::jwt::{self, AdminClaims},
};

/// 已通过鉴权的管理员
#[derive(Debug, Clone)]
pub struct AdminContext {
    pub operator: String,
    pub claims: AdminClaims,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let trace_id = parts.extensions.get::<TraceId>().cloned();
        let reject = |err: AppError| match &trace_id {
            Some(trace_id) => trace_id.tag(err),
            None => err,
        };

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| reject(AppError::unauthorized("Missing bearer token")))?;

        let claims = jwt::verify_token(&state.config.admin.jwt_secret, token).map_err(|e| {
            tracing::warn!(path = %parts.uri.path(), error = %e, "Admin token rejected");
            reject(AppError::from(e))
        })?;

        if !claims.is_admin() {
            tracing::warn!(operator = %claims.sub, role = %claims.role, "Non-admin token on admin endpoint");
            return Err(reject(AppError::forbidden("Admin role required")));
        }

        Ok(Self {
            operator: claims.sub.clone(),
            claims,
        })
    }
}
