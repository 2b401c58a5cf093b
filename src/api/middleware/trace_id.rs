//! Trace ID 中间件
//! 为每个请求生成或沿用 X-Trace-Id，写入请求扩展与响应头

use axum::{
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::{domain::BridgeError, error::AppError};

pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// 当前请求的 trace_id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(pub String);

impl TraceId {
    /// 从请求头中提取 trace_id，如果没有则生成新的
    fn from_request(req: &Request) -> Self {
        let incoming = req
            .headers()
            .get(TRACE_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= 128);

        match incoming {
            Some(id) => Self(id.to_string()),
            None => Self(Uuid::new_v4().to_string()),
        }
    }

    /// 领域错误转为带 trace_id 的 HTTP 错误
    pub fn error(&self, err: BridgeError) -> AppError {
        AppError::from(err).with_trace_id(self.0.clone())
    }

    pub fn tag(&self, err: AppError) -> AppError {
        err.with_trace_id(self.0.clone())
    }
}

pub async fn trace_id_middleware(mut req: Request, next: Next) -> Response {
    let trace_id = TraceId::from_request(&req);
    req.extensions_mut().insert(trace_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = HeaderValue::from_str(&trace_id.0) {
        response.headers_mut().insert(TRACE_ID_HEADER, header_value);
    }
    response
}

/// Axum Extractor: 从 request extensions 中提取 trace_id（未经过中间件时临时生成）
#[axum::async_trait]
impl<S> FromRequestParts<S> for TraceId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<TraceId>()
            .cloned()
            .unwrap_or_else(|| TraceId(Uuid::new_v4().to_string())))
    }
}
