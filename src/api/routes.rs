//! Route Definitions
//!
//! `/v2/<group>` routes sit behind the access gate; `/`, `/v2/health-check`,
//! `/v2/socket` and `/metrics` are open.

use super::{
    handlers::*,
    security::{access_gate, AccessGate, GatePolicy},
    websocket::live_socket_handler,
};
use axum::{middleware::from_fn_with_state, routing::get, Router};
use std::sync::Arc;

/// Build the API router
///
/// Groups listed in `required_groups` reject callers without valid
/// credentials instead of treating them as anonymous.
pub fn create_router(state: Arc<AppState>, gate: AccessGate, required_groups: &[String]) -> Router {
    let mut v2: Router<Arc<AppState>> = Router::new();

    for group in ROUTE_GROUPS {
        let policy = if required_groups.iter().any(|g| g == group) {
            GatePolicy::RequireCredential
        } else {
            GatePolicy::Optional
        };
        let routes: Router<Arc<AppState>> = Router::new()
            .route("/", get(move || group_root_handler(group)))
            .route_layer(from_fn_with_state(gate.with_policy(policy), access_gate));
        v2 = v2.nest(&format!("/{}", group), routes);
    }

    let gated: Router<Arc<AppState>> = Router::new()
        .route("/access", get(access_handler))
        .route_layer(from_fn_with_state(gate.with_policy(GatePolicy::Optional), access_gate));

    let v2 = v2
        .merge(gated)
        .route("/health-check", get(health_handler))
        .route("/socket", get(live_socket_handler));

    Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/v2", v2)
        .fallback(not_found_handler)
        .with_state(state)
}
