//! 跨链桥 API
//!
//! 转账准入、状态查询、取消、手续费报价与运行状态

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    api::middleware::TraceId,
    app_state::AppState,
    domain::{amount_serde, Amount, BridgeTransaction, NetworkDescriptor, TransferRequest, TransferStatus},
    error::AppError,
    repository::NetworkStats,
    service::PauseMode,
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub transaction_id: Uuid,
    pub status: TransferStatus,
    #[serde(with = "amount_serde")]
    #[schema(value_type = String, example = "15000")]
    pub fee: Amount,
    /// 预计耗时（秒）
    pub estimated_time: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeeRequest {
    pub source_network: String,
    pub dest_network: String,
    #[serde(with = "amount_serde")]
    #[schema(value_type = String, example = "1000000")]
    pub amount: Amount,
    #[serde(default)]
    pub express: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeeResponse {
    #[serde(with = "amount_serde")]
    #[schema(value_type = String, example = "15000")]
    pub fee: Amount,
    /// 预计耗时（秒）
    pub estimated_time: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatusResponse {
    pub paused: bool,
    pub mode: Option<PauseMode>,
    pub networks: Vec<NetworkDescriptor>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatsQuery {
    /// 回看小时数，默认 24
    pub hours: Option<i64>,
}

/// JSON 解析失败统一返回 400
pub(crate) fn json_body<T>(trace_id: &TraceId, body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|e| trace_id.tag(AppError::bad_request(e.body_text())))
}

pub(crate) fn parse_id(trace_id: &TraceId, raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|_| trace_id.tag(AppError::bad_request(format!("Invalid transaction id '{raw}'"))))
}

/// 后台立即推进一笔交易，不阻塞请求
pub(crate) fn kick(state: &AppState, transaction_id: Uuid) {
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.process(transaction_id).await {
            tracing::warn!(transaction_id = %transaction_id, error = %e, "Immediate processing failed");
        }
    });
}

/// POST /bridge/transfer - 发起跨链转账
#[utoipa::path(
    post,
    path = "/bridge/transfer",
    request_body = TransferRequest,
    responses(
        (status = 200, description = "已准入", body = TransferResponse),
        (status = 400, description = "校验失败或超出限额")
    ),
    tag = "Cross-Chain Bridge"
)]
pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    body: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Json<TransferResponse>, AppError> {
    let request = json_body(&trace_id, body)?;
    let tx = state
        .request_validator
        .admit(request)
        .await
        .map_err(|e| trace_id.error(e))?;

    kick(&state, tx.id);

    Ok(Json(TransferResponse {
        transaction_id: tx.id,
        status: tx.status,
        fee: tx.fee_amount,
        estimated_time: state.request_validator.estimate_time_secs(&tx),
    }))
}

/// GET /bridge/transfer/{id} - 查询转账状态
#[utoipa::path(
    get,
    path = "/bridge/transfer/{id}",
    params(("id" = String, Path, description = "转账 id")),
    responses(
        (status = 200, description = "转账记录", body = BridgeTransaction),
        (status = 404, description = "不存在")
    ),
    tag = "Cross-Chain Bridge"
)]
pub async fn get_transfer(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    Path(id): Path<String>,
) -> Result<Json<BridgeTransaction>, AppError> {
    let id = parse_id(&trace_id, &id)?;
    let tx = state
        .store
        .get(id)
        .await
        .map_err(|e| trace_id.error(e))?
        .ok_or_else(|| trace_id.tag(AppError::not_found(format!("Transaction {id} not found"))))?;
    Ok(Json(tx))
}

/// POST /bridge/transfer/{id}/cancel - 取消 pending 转账
#[utoipa::path(
    post,
    path = "/bridge/transfer/{id}/cancel",
    params(("id" = String, Path, description = "转账 id")),
    responses(
        (status = 200, description = "已取消", body = BridgeTransaction),
        (status = 404, description = "不存在"),
        (status = 409, description = "已开始锁定，不可取消")
    ),
    tag = "Cross-Chain Bridge"
)]
pub async fn cancel_transfer(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    Path(id): Path<String>,
) -> Result<Json<BridgeTransaction>, AppError> {
    let id = parse_id(&trace_id, &id)?;
    let tx = state.engine.cancel(id).await.map_err(|e| trace_id.error(e))?;
    tracing::info!(transaction_id = %id, "Bridge transfer cancelled by user");
    Ok(Json(tx))
}

/// POST /bridge/fee - 手续费报价
#[utoipa::path(
    post,
    path = "/bridge/fee",
    request_body = FeeRequest,
    responses(
        (status = 200, description = "报价", body = FeeResponse),
        (status = 400, description = "参数错误")
    ),
    tag = "Cross-Chain Bridge"
)]
pub async fn estimate_fee(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    body: Result<Json<FeeRequest>, JsonRejection>,
) -> Result<Json<FeeResponse>, AppError> {
    let request = json_body(&trace_id, body)?;
    let quote = state
        .request_validator
        .quote(
            &request.source_network,
            &request.dest_network,
            request.amount,
            request.express,
        )
        .map_err(|e| trace_id.error(e))?;

    Ok(Json(FeeResponse {
        fee: quote.fee,
        estimated_time: quote.estimated_time_secs,
    }))
}

/// GET /bridge/status - 暂停状态与启用网络
#[utoipa::path(
    get,
    path = "/bridge/status",
    responses((status = 200, description = "运行状态", body = BridgeStatusResponse)),
    tag = "Cross-Chain Bridge"
)]
pub async fn bridge_status(State(state): State<Arc<AppState>>) -> Json<BridgeStatusResponse> {
    let mode = state.emergency_stop.mode();
    Json(BridgeStatusResponse {
        paused: mode.is_some(),
        mode,
        networks: state.registry.list_enabled(),
    })
}

/// GET /bridge/stats - 按网络按时间桶的统计
#[utoipa::path(
    get,
    path = "/bridge/stats",
    params(StatsQuery),
    responses((status = 200, description = "统计", body = [NetworkStats])),
    tag = "Cross-Chain Bridge"
)]
pub async fn bridge_stats(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<NetworkStats>>, AppError> {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 90);
    let since = state.clock.now() - Duration::hours(hours);
    let stats = state.stats.list(since).await.map_err(|e| trace_id.error(e))?;
    Ok(Json(stats))
}
