use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi, ToSchema,
};

use crate::{app_state::AppState, infrastructure::db};

pub mod admin_api;
pub mod bridge_api;
pub mod middleware;
pub mod validator_api;

use middleware::trace_id_middleware;

#[derive(OpenApi)]
#[openapi(
    paths(
        bridge_api::create_transfer,
        bridge_api::get_transfer,
        bridge_api::cancel_transfer,
        bridge_api::estimate_fee,
        bridge_api::bridge_status,
        bridge_api::bridge_stats,
        validator_api::submit_attestation,
        validator_api::list_validators,
        validator_api::register_validator,
        validator_api::slash_validator,
        validator_api::activate_validator,
        admin_api::pause_bridge,
        admin_api::resume_bridge,
        admin_api::list_events,
        admin_api::reload_networks,
        healthz,
    ),
    components(
        schemas(
            crate::domain::TransferRequest,
            crate::domain::BridgeTransaction,
            crate::domain::Attestation,
            crate::domain::TransferStatus,
            crate::domain::NetworkDescriptor,
            crate::domain::AddressFormat,
            crate::domain::Validator,
            crate::repository::NetworkStats,
            crate::infrastructure::event_bus::BridgeEvent,
            crate::infrastructure::event_bus::EventEnvelope,
            crate::service::PauseMode,
            crate::service::QuorumStatus,
            crate::service::RejectionReason,
            bridge_api::TransferResponse,
            bridge_api::FeeRequest,
            bridge_api::FeeResponse,
            bridge_api::BridgeStatusResponse,
            validator_api::AttestationRequest,
            validator_api::AttestationResponse,
            validator_api::RegisterValidatorRequest,
            validator_api::SlashRequest,
            admin_api::PauseRequest,
            admin_api::PauseResponse,
            admin_api::ResumeResponse,
            admin_api::ReloadNetworksRequest,
            crate::config::NetworkConfig,
            Healthz,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Cross-Chain Bridge", description = "跨链桥编排服务")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api-docs/openapi.json", get(openapi_json))
        .route("/bridge/transfer", post(bridge_api::create_transfer))
        .route("/bridge/transfer/:id", get(bridge_api::get_transfer))
        .route("/bridge/transfer/:id/cancel", post(bridge_api::cancel_transfer))
        .route("/bridge/fee", post(bridge_api::estimate_fee))
        .route("/bridge/status", get(bridge_api::bridge_status))
        .route("/bridge/stats", get(bridge_api::bridge_stats))
        .route("/bridge/attestations", post(validator_api::submit_attestation))
        .route(
            "/bridge/validators",
            get(validator_api::list_validators).post(validator_api::register_validator),
        )
        .route(
            "/bridge/validators/:address/slash",
            post(validator_api::slash_validator),
        )
        .route(
            "/bridge/validators/:address/activate",
            post(validator_api::activate_validator),
        )
        .route("/bridge/pause", post(admin_api::pause_bridge))
        .route("/bridge/resume", post(admin_api::resume_bridge))
        .route("/bridge/events", get(admin_api::list_events))
        .route("/bridge/networks/reload", post(admin_api::reload_networks))
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(trace_id_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Healthz {
    pub status: String,
    pub version: String,
    /// 未配置数据库时为空
    pub db_ok: Option<bool>,
    pub paused: bool,
}

/// GET /healthz - 存活与依赖探测
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "正常", body = Healthz),
        (status = 503, description = "数据库不可用", body = Healthz)
    ),
    tag = "Cross-Chain Bridge"
)]
pub async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Healthz>) {
    let db_ok = match &state.pool {
        Some(pool) => Some(db::health_check(pool).await.is_ok()),
        None => None,
    };
    let healthy = db_ok.unwrap_or(true);

    let body = Healthz {
        status: if healthy { "ok" } else { "degraded" }.into(),
        version: env!("CARGO_PKG_VERSION").into(),
        db_ok,
        paused: state.emergency_stop.is_engaged(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn metrics() -> Response {
    let mut resp = crate::metrics::render_prometheus().into_response();
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    resp
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
