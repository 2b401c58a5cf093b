//! 管理员 API
//!
//! 紧急暂停/恢复、事件历史与网络配置热加载，均需管理员 JWT

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    api::{
        bridge_api::json_body,
        middleware::{AdminContext, TraceId},
    },
    app_state::AppState,
    config::NetworkConfig,
    domain::NetworkDescriptor,
    error::AppError,
    infrastructure::event_bus::EventEnvelope,
    service::PauseMode,
};

const DEFAULT_EVENT_LIMIT: i64 = 50;
const MAX_EVENT_LIMIT: i64 = 500;

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct PauseRequest {
    /// 缺省为 halt
    #[serde(default)]
    pub mode: Option<PauseMode>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PauseResponse {
    pub paused: bool,
    pub mode: PauseMode,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub paused: bool,
    pub was_paused: bool,
}

/// 完整的网络列表，整体替换当前注册表
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReloadNetworksRequest {
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// POST /bridge/pause - 紧急暂停
#[utoipa::path(
    post,
    path = "/bridge/pause",
    request_body(content = PauseRequest, description = "可为空，默认 halt"),
    responses(
        (status = 200, description = "已暂停", body = PauseResponse),
        (status = 400, description = "模式无效"),
        (status = 401, description = "未授权"),
        (status = 403, description = "非管理员")
    ),
    security(("bearer_auth" = [])),
    tag = "Cross-Chain Bridge"
)]
pub async fn pause_bridge(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    admin: AdminContext,
    body: Bytes,
) -> Result<Json<PauseResponse>, AppError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        PauseRequest::default()
    } else {
        serde_json::from_slice::<PauseRequest>(&body)
            .map_err(|e| trace_id.tag(AppError::bad_request(format!("Invalid pause request: {e}"))))?
    };
    let mode = request.mode.unwrap_or(PauseMode::Halt);

    state.emergency_stop.engage(mode);
    tracing::warn!(operator = %admin.operator, mode = ?mode, "Bridge paused");

    Ok(Json(PauseResponse { paused: true, mode }))
}

/// POST /bridge/resume - 解除暂停
#[utoipa::path(
    post,
    path = "/bridge/resume",
    responses(
        (status = 200, description = "已恢复", body = ResumeResponse),
        (status = 401, description = "未授权"),
        (status = 403, description = "非管理员")
    ),
    security(("bearer_auth" = [])),
    tag = "Cross-Chain Bridge"
)]
pub async fn resume_bridge(
    State(state): State<Arc<AppState>>,
    admin: AdminContext,
) -> Json<ResumeResponse> {
    let was_paused = state.emergency_stop.release();
    tracing::warn!(operator = %admin.operator, was_paused, "Bridge resumed");

    Json(ResumeResponse {
        paused: false,
        was_paused,
    })
}

/// GET /bridge/events - 最近的状态事件（新的在前）
#[utoipa::path(
    get,
    path = "/bridge/events",
    params(EventsQuery),
    responses(
        (status = 200, description = "事件列表", body = [EventEnvelope]),
        (status = 401, description = "未授权")
    ),
    security(("bearer_auth" = [])),
    tag = "Cross-Chain Bridge"
)]
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    _admin: AdminContext,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventEnvelope>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let events = state
        .events
        .history(limit, offset)
        .await
        .map_err(|e| trace_id.tag(AppError::internal(format!("Failed to load events: {e}"))))?;
    Ok(Json(events))
}

/// POST /bridge/networks/reload - 热加载网络配置
///
/// 任一条目校验失败时整体拒绝，继续使用旧配置；已准入交易的手续费不受影响
#[utoipa::path(
    post,
    path = "/bridge/networks/reload",
    request_body = ReloadNetworksRequest,
    responses(
        (status = 200, description = "加载后启用的网络", body = [NetworkDescriptor]),
        (status = 400, description = "配置无效"),
        (status = 401, description = "未授权"),
        (status = 403, description = "非管理员")
    ),
    security(("bearer_auth" = [])),
    tag = "Cross-Chain Bridge"
)]
pub async fn reload_networks(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    admin: AdminContext,
    body: Result<Json<ReloadNetworksRequest>, JsonRejection>,
) -> Result<Json<Vec<NetworkDescriptor>>, AppError> {
    let request = json_body(&trace_id, body)?;
    state
        .registry
        .reload(&request.networks)
        .map_err(|e| trace_id.tag(AppError::bad_request(e.to_string())))?;

    let enabled = state.registry.list_enabled();
    tracing::warn!(
        operator = %admin.operator,
        networks = request.networks.len(),
        enabled = enabled.len(),
        "Network configuration reloaded by admin"
    );
    Ok(Json(enabled))
}
