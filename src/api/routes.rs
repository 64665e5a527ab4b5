//! API Routes
//!
//! JSON endpoints for the bypass flow, health and metrics

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::service::{BypassResponse, PicketService, ServiceError};
use crate::types::normalize_ip;

#[derive(Debug, Default, Deserialize)]
struct DomainQuery {
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BypassRequest {
    #[serde(default)]
    domain: String,
}

/// Build the router over a shared service
///
/// CORS is open: the block page that calls these endpoints is served from
/// whatever host the sinkhole points at.
pub fn router(service: Arc<PicketService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        // Health & metrics
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics/json", get(get_metrics_json))

        // Bypass flow
        .route("/api/check", get(check_domain))
        .route("/api/bypass", get(bypass_and_redirect).post(create_bypass))
        .route("/api/info", get(domain_info))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(service)
}

/// Run the HTTP API server until shutdown
pub async fn run_api_server(
    addr: SocketAddr,
    service: Arc<PicketService>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("📊 Bypass API listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;

    Ok(())
}

/// Requesting client: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    match forwarded.or_else(real_ip) {
        Some(ip) => normalize_ip(ip),
        None => peer.map_or_else(|| "unknown".to_string(), |p| normalize_ip(&p.to_string())),
    }
}

fn service_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::MissingDomain | ServiceError::InvalidDomain => StatusCode::BAD_REQUEST,
        ServiceError::NotBlocked => StatusCode::NOT_FOUND,
        ServiceError::BypassDisabled => StatusCode::FORBIDDEN,
        ServiceError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// GET /health
async fn health_check(State(service): State<Arc<PicketService>>) -> impl IntoResponse {
    Json(service.health().await)
}

/// GET /metrics - Prometheus format metrics
async fn get_metrics_prometheus(State(service): State<Arc<PicketService>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        service.prometheus_metrics().await,
    )
}

/// GET /metrics/json
async fn get_metrics_json(State(service): State<Arc<PicketService>>) -> impl IntoResponse {
    Json(service.json_metrics().await)
}

/// GET /api/check?domain=
async fn check_domain(
    State(service): State<Arc<PicketService>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<DomainQuery>,
) -> Response {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let domain = query.domain.unwrap_or_default();

    match service.check(&ip, &domain).await {
        Ok(check) => Json(check).into_response(),
        Err(e) => error_json(service_status(&e), e.public_message()),
    }
}

/// POST /api/bypass {"domain": ".."}
async fn create_bypass(
    State(service): State<Arc<PicketService>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<BypassRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(BypassResponse::failed("Invalid request body")),
        )
            .into_response();
    };

    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    match service.create_bypass(&ip, &request.domain).await {
        Ok(grant) => Json(BypassResponse::granted(grant)).into_response(),
        Err(e) => (service_status(&e), Json(BypassResponse::failed(e.public_message()))).into_response(),
    }
}

/// GET /api/bypass?domain= - issue and redirect to the site
async fn bypass_and_redirect(
    State(service): State<Arc<PicketService>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<DomainQuery>,
) -> Response {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let domain = query.domain.unwrap_or_default();

    match service.create_bypass(&ip, &domain).await {
        Ok(grant) => Redirect::temporary(&grant.redirect_url).into_response(),
        Err(e) => (service_status(&e), Json(BypassResponse::failed(e.public_message()))).into_response(),
    }
}

/// GET /api/info?domain=
async fn domain_info(
    State(service): State<Arc<PicketService>>,
    Query(query): Query<DomainQuery>,
) -> Response {
    let domain = query.domain.unwrap_or_default();

    match service.info(&domain).await {
        Ok(Some(info)) => Json(info).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "domain is not blocked"),
        Err(e) => error_json(service_status(&e), e.public_message()),
    }
}
