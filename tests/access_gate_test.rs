//! HTTP-level access control scenarios
//!
//! Drives the assembled router with `tower::ServiceExt::oneshot`, injecting the
//! peer address the way `into_make_service_with_connect_info` would and a
//! manual clock so window roll-over needs no sleeping.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, Response, StatusCode},
    Router,
};
use bchgate::{
    api::{GatewayApp, TierLimits, TokenIssuer},
    clock::ManualClock,
    config::GatewayConfig,
};
use futures_util::future::join_all;
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceExt;

const SECRET: &str = "integration-signing-secret";
const PRIVILEGED: &str = "integration-privileged-0001";

struct Harness {
    router: Router,
    clock: ManualClock,
    config: GatewayConfig,
}

impl Harness {
    fn new(anonymous: u32) -> Self {
        Self::with_config(|config| config.rate_limit.anonymous_requests = anonymous)
    }

    fn with_config(customize: impl FnOnce(&mut GatewayConfig)) -> Self {
        let mut config = GatewayConfig::default();
        config.rate_limit.window_seconds = 60;
        config.rate_limit.basic_requests = 600;
        config.rate_limit.max_requests_per_window = 6_000;
        config.auth.jwt_secret = Some(SECRET.to_string());
        config.auth.privileged_secret = Some(PRIVILEGED.to_string());
        customize(&mut config);
        config.validate().unwrap();

        // Aligned on a window boundary: a full 60s remain in the first window
        let clock = ManualClock::at_secs(1_800);
        let app = GatewayApp::build(&config, Arc::new(clock.clone()));
        Self {
            router: app.router,
            clock,
            config,
        }
    }

    fn token(&self, subject: &str, tier: &str) -> String {
        TokenIssuer::new(SECRET, TierLimits::from(&self.config.rate_limit))
            .issue(subject, tier, Duration::from_secs(3_600))
            .unwrap()
    }

    async fn get(&self, path: &str, peer: [u8; 4], bearer: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(value) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", value));
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 52_000))));
        self.router.clone().oneshot(request).await.unwrap()
    }
}

async fn json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn header_u64(response: &Response<Body>, name: &str) -> u64 {
    response.headers()[name].to_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_sixth_request_in_window_is_rejected_then_recovers() {
    let harness = Harness::new(5);
    let peer = [203, 0, 113, 7];

    for _ in 0..5 {
        let response = harness.get("/v2/block", peer, None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let rejected = harness.get("/v2/block", peer, None).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_u64(&rejected, "retry-after"), 60);
    let body = json(rejected).await;
    assert!(body["error"].as_str().unwrap().contains("Too many requests"));
    assert_eq!(body["code"], "RATE_LIMITED");

    harness.clock.advance(Duration::from_secs(60));
    let response = harness.get("/v2/block", peer, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["status"], "block");
}

#[tokio::test]
async fn test_pro_token_is_isolated_from_anonymous_callers() {
    let harness = Harness::new(5);
    let token = harness.token("S1", "pro-240");

    for i in 0..60 {
        let response = harness
            .get("/v2/transaction", [198, 51, 100, 1], Some(&token))
            .await;
        assert_eq!(response.status(), StatusCode::OK, "request {} rejected", i);
        assert_eq!(header_u64(&response, "x-ratelimit-limit"), 240);
    }

    let anonymous = [198, 51, 100, 2];
    for _ in 0..5 {
        assert_eq!(
            harness.get("/v2/transaction", anonymous, None).await.status(),
            StatusCode::OK
        );
    }
    assert_eq!(
        harness.get("/v2/transaction", anonymous, None).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    // The token holder is unaffected by the anonymous bucket running dry
    assert_eq!(
        harness
            .get("/v2/transaction", [198, 51, 100, 2], Some(&token))
            .await
            .status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_quota_is_shared_across_route_groups() {
    let harness = Harness::new(2);
    let peer = [192, 0, 2, 50];
    assert_eq!(harness.get("/v2/address", peer, None).await.status(), StatusCode::OK);
    assert_eq!(harness.get("/v2/mining", peer, None).await.status(), StatusCode::OK);
    assert_eq!(
        harness.get("/v2/util", peer, None).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_concurrent_requests_admit_exactly_capacity() {
    let harness = Harness::new(20);
    let responses = join_all((0..35).map(|_| harness.get("/v2/network", [10, 1, 1, 1], None))).await;

    let admitted = responses
        .iter()
        .filter(|r| r.status() == StatusCode::OK)
        .count();
    let rejected = responses
        .iter()
        .filter(|r| r.status() == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(admitted, 20);
    assert_eq!(rejected, 15);
}

#[tokio::test]
async fn test_oversized_tier_claim_is_clamped() {
    let harness = Harness::new(5);
    let token = harness.token("greedy", "pro-100000000");

    let response = harness.get("/v2/util", [10, 0, 0, 9], Some(&token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_u64(&response, "x-ratelimit-limit"), 6_000);

    let token = harness.token("greedier", "pro-123456789012345678901234567890");
    let body = json(harness.get("/v2/access", [10, 0, 0, 9], Some(&token)).await).await;
    assert_eq!(body["identity"], "sub:greedier");
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["requests_per_window"], 6_000);
}

#[tokio::test]
async fn test_forged_token_falls_back_to_anonymous() {
    let harness = Harness::new(1);
    let forged = TokenIssuer::new("some-other-secret", TierLimits::from(&harness.config.rate_limit))
        .issue("S1", "pro-240", Duration::from_secs(3_600))
        .unwrap();
    let peer = [10, 0, 0, 10];

    let response = harness.get("/v2/access", peer, Some(&forged)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["identity"], "ip:10.0.0.10");
    assert_eq!(body["tier"], "anonymous");
    assert_eq!(body["authenticated"], false);

    assert_eq!(
        harness.get("/v2/access", peer, None).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_rate_limit_headers_count_down() {
    let harness = Harness::new(3);
    let peer = [172, 16, 0, 3];

    let first = harness.get("/v2/blockchain", peer, None).await;
    assert_eq!(header_u64(&first, "x-ratelimit-limit"), 3);
    assert_eq!(header_u64(&first, "x-ratelimit-remaining"), 2);
    assert_eq!(header_u64(&first, "x-ratelimit-reset"), 60);

    harness.clock.advance(Duration::from_secs(15));
    let second = harness.get("/v2/blockchain", peer, None).await;
    assert_eq!(header_u64(&second, "x-ratelimit-remaining"), 1);
    assert_eq!(header_u64(&second, "x-ratelimit-reset"), 45);
}

#[tokio::test]
async fn test_access_introspection_for_token_holder() {
    let harness = Harness::new(5);
    let token = harness.token("S7", "basic");

    let body = json(harness.get("/v2/access", [10, 9, 9, 9], Some(&token)).await).await;
    assert_eq!(body["identity"], "sub:S7");
    assert_eq!(body["tier"], "basic");
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["requests_per_window"], 600);
    assert_eq!(body["window_seconds"], 60);
    assert_eq!(body["remaining"], 599);
}

#[tokio::test]
async fn test_privileged_secret_gets_highest_tier() {
    let harness = Harness::new(1);
    let body = json(harness.get("/v2/access", [10, 2, 2, 2], Some(PRIVILEGED)).await).await;
    assert_eq!(body["identity"], "privileged");
    assert_eq!(body["requests_per_window"], 6_000);
}

#[tokio::test]
async fn test_required_credential_groups() {
    let harness = Harness::with_config(|config| {
        config.rate_limit.anonymous_requests = 5;
        config.rate_limit.auth_required_groups = vec!["control".to_string()];
    });
    let peer = [10, 3, 3, 3];

    let response = harness.get("/v2/control", peer, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await["code"], "UNAUTHORIZED");

    let response = harness.get("/v2/control", peer, Some("not-a-token")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = harness.token("operator", "basic");
    let response = harness.get("/v2/control", peer, Some(&token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["status"], "control");

    // Other groups still accept anonymous callers
    assert_eq!(harness.get("/v2/mining", peer, None).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_open_endpoints_bypass_the_gate() {
    let harness = Harness::new(1);
    let peer = [10, 4, 4, 4];

    for _ in 0..5 {
        let response = harness.get("/v2/health-check", peer, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
    let health = json(harness.get("/v2/health-check", peer, None).await).await;
    assert_eq!(health["status"], "winning");
    assert_eq!(health["feed"], false);
    assert_eq!(health["subscribers"], 0);

    assert_eq!(harness.get("/", peer, None).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_and_not_found() {
    let harness = Harness::new(1);
    let peer = [10, 5, 5, 5];
    harness.get("/v2/slp", peer, None).await;
    harness.get("/v2/slp", peer, None).await;

    let response = harness.get("/metrics", peer, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("bchgate_requests_admitted_total 1"));
    assert!(text.contains("bchgate_requests_rejected_total 1"));

    let missing = harness.get("/v2/nowhere", peer, None).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(missing).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let harness = Harness::new(5);
    let mut request = Request::builder()
        .uri("/v2/block")
        .header("x-request-id", "trace-abc")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([10, 6, 6, 6], 1))));
    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "trace-abc");
}
