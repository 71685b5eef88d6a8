//! Request Handlers
//!
//! The versioned groups only expose their roots here; each sits behind the
//! access gate so callers see quota headers and 429s on every group.

use super::{
    errors::ApiError,
    middleware::RequestId,
    models::{AccessResponse, HealthResponse, StatusResponse},
    security::AccessContext,
};
use crate::{feed::SubscriptionRegistry, metrics::GatewayMetrics};
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Versioned route groups served under `/v2`
pub const ROUTE_GROUPS: [&str; 10] = [
    "address",
    "block",
    "blockchain",
    "control",
    "mining",
    "network",
    "rawtransactions",
    "slp",
    "transaction",
    "util",
];

/// Shared application state
pub struct AppState {
    pub version: String,
    pub window_seconds: u64,
    pub metrics: Arc<GatewayMetrics>,
    pub registry: Arc<SubscriptionRegistry>,
    pub feed_enabled: AtomicBool,
}

impl AppState {
    pub fn new(
        window_seconds: u64,
        metrics: Arc<GatewayMetrics>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            window_seconds,
            metrics,
            registry,
            feed_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_feed_enabled(&self, enabled: bool) {
        self.feed_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn feed_enabled(&self) -> bool {
        self.feed_enabled.load(Ordering::Relaxed)
    }
}

/// GET /
pub async fn root_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "winning".to_string(),
    })
}

/// GET /v2/health-check
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "winning".to_string(),
        feed: state.feed_enabled(),
        subscribers: state.registry.count(),
    })
}

/// GET /v2/<group>
pub async fn group_root_handler(group: &'static str) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: group.to_string(),
    })
}

/// GET /v2/access
pub async fn access_handler(
    State(state): State<Arc<AppState>>,
    Extension(context): Extension<AccessContext>,
) -> Json<AccessResponse> {
    Json(AccessResponse {
        identity: context.identity.to_string(),
        authenticated: context.identity.is_authenticated(),
        tier: context.tier.to_string(),
        requests_per_window: context.tier.requests_per_window,
        window_seconds: state.window_seconds,
        remaining: context.remaining,
        reset_after_secs: context.reset_after_secs,
    })
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.to_prometheus_format(),
    )
}

/// Fallback for unknown paths
pub async fn not_found_handler(
    request_id: Option<Extension<RequestId>>,
    uri: Uri,
) -> ApiError {
    ApiError::not_found(
        request_id.map(|Extension(id)| id.0),
        format!("No route for {}", uri.path()),
    )
}
