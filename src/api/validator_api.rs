//! 验证者 API
//!
//! 签名提交、验证者注册、罚没与重新启用

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    api::{
        bridge_api::{json_body, kick, parse_id},
        middleware::{AdminContext, TraceId},
    },
    app_state::AppState,
    domain::{amount_serde, Amount, Validator},
    error::AppError,
    service::{AttestationOutcome, QuorumStatus, RejectionReason},
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttestationRequest {
    pub transaction_id: String,
    pub validator_id: String,
    /// ed25519 签名（hex）
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttestationResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quorum: Option<QuorumStatus>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterValidatorRequest {
    /// ed25519 公钥（hex 或 base58）
    pub address: String,
    pub network: String,
    #[serde(with = "amount_serde")]
    #[schema(value_type = String, example = "1000000")]
    pub stake: Amount,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SlashRequest {
    #[serde(with = "amount_serde")]
    #[schema(value_type = String, example = "1000")]
    pub amount: Amount,
    pub reason: String,
}

/// POST /bridge/attestations - 提交验证者签名
///
/// 签名被拒绝时仍返回 200，accepted=false 并附原因
#[utoipa::path(
    post,
    path = "/bridge/attestations",
    request_body = AttestationRequest,
    responses(
        (status = 200, description = "处理结果", body = AttestationResponse),
        (status = 400, description = "请求格式错误"),
        (status = 404, description = "交易不存在")
    ),
    tag = "Cross-Chain Bridge"
)]
pub async fn submit_attestation(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    body: Result<Json<AttestationRequest>, JsonRejection>,
) -> Result<Json<AttestationResponse>, AppError> {
    let request = json_body(&trace_id, body)?;
    let transaction_id = parse_id(&trace_id, &request.transaction_id)?;

    let outcome = state
        .consensus
        .submit_attestation(transaction_id, &request.validator_id, &request.signature)
        .await
        .map_err(|e| trace_id.error(e))?;

    let response = match outcome {
        AttestationOutcome::Accepted(quorum) => {
            if quorum.reached {
                kick(&state, transaction_id);
            }
            AttestationResponse {
                accepted: true,
                reason: None,
                quorum: Some(quorum),
            }
        }
        AttestationOutcome::Rejected(reason) => AttestationResponse {
            accepted: false,
            reason: Some(reason),
            quorum: None,
        },
    };
    Ok(Json(response))
}

/// GET /bridge/validators - 验证者列表
#[utoipa::path(
    get,
    path = "/bridge/validators",
    responses((status = 200, description = "验证者列表", body = [Validator])),
    tag = "Cross-Chain Bridge"
)]
pub async fn list_validators(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
) -> Result<Json<Vec<Validator>>, AppError> {
    let validators = state
        .consensus
        .list_validators()
        .await
        .map_err(|e| trace_id.error(e))?;
    Ok(Json(validators))
}

/// POST /bridge/validators - 注册验证者（管理员）
#[utoipa::path(
    post,
    path = "/bridge/validators",
    request_body = RegisterValidatorRequest,
    responses(
        (status = 201, description = "已注册", body = Validator),
        (status = 400, description = "公钥无效"),
        (status = 401, description = "未授权"),
        (status = 409, description = "已存在")
    ),
    security(("bearer_auth" = [])),
    tag = "Cross-Chain Bridge"
)]
pub async fn register_validator(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    admin: AdminContext,
    body: Result<Json<RegisterValidatorRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Validator>), AppError> {
    let request = json_body(&trace_id, body)?;
    state
        .registry
        .get(&request.network)
        .map_err(|e| trace_id.tag(AppError::bad_request(e.to_string())))?;

    let validator = state
        .consensus
        .register_validator(&request.address, &request.network, request.stake)
        .await
        .map_err(|e| trace_id.error(e))?;

    tracing::info!(operator = %admin.operator, validator_id = %validator.address, "Validator registered by admin");
    Ok((StatusCode::CREATED, Json(validator)))
}

/// POST /bridge/validators/{address}/slash - 罚没验证者（管理员）
#[utoipa::path(
    post,
    path = "/bridge/validators/{address}/slash",
    params(("address" = String, Path, description = "验证者公钥")),
    request_body = SlashRequest,
    responses(
        (status = 200, description = "罚没后的验证者", body = Validator),
        (status = 401, description = "未授权"),
        (status = 404, description = "验证者不存在")
    ),
    security(("bearer_auth" = [])),
    tag = "Cross-Chain Bridge"
)]
pub async fn slash_validator(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    admin: AdminContext,
    Path(address): Path<String>,
    body: Result<Json<SlashRequest>, JsonRejection>,
) -> Result<Json<Validator>, AppError> {
    let request = json_body(&trace_id, body)?;
    let validator = state
        .consensus
        .slash(&address, request.amount, &request.reason)
        .await
        .map_err(|e| trace_id.error(e))?;

    tracing::warn!(operator = %admin.operator, validator_id = %address, "Validator slashed by admin");
    Ok(Json(validator))
}

/// POST /bridge/validators/{address}/activate - 重新启用验证者（管理员）
///
/// 用于因长期未签名被停用的验证者；被罚没到信誉下限以下的返回 409
#[utoipa::path(
    post,
    path = "/bridge/validators/{address}/activate",
    params(("address" = String, Path, description = "验证者公钥")),
    responses(
        (status = 200, description = "已启用的验证者", body = Validator),
        (status = 401, description = "未授权"),
        (status = 404, description = "验证者不存在"),
        (status = 409, description = "信誉低于下限")
    ),
    security(("bearer_auth" = [])),
    tag = "Cross-Chain Bridge"
)]
pub async fn activate_validator(
    State(state): State<Arc<AppState>>,
    trace_id: TraceId,
    admin: AdminContext,
    Path(address): Path<String>,
) -> Result<Json<Validator>, AppError> {
    let validator = state
        .consensus
        .reactivate(&address)
        .await
        .map_err(|e| trace_id.error(e))?;

    tracing::info!(
        operator = %admin.operator,
        validator_id = %address,
        "Validator reactivated by admin"
    );
    Ok(Json(validator))
}
