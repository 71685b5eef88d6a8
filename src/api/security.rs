//! Access gate for versioned route groups
//!
//! Runs ahead of every protected route: resolves the caller's credentials,
//! charges one request against the caller's quota, and either attaches an
//! [`AccessContext`] to the request or answers with 401/429 without touching
//! the route handler.

use super::{
    auth::{CredentialResolver, Identity, Tier},
    errors::ApiError,
    middleware::RequestId,
    quota::{Admission, QuotaEnforcer},
};
use crate::metrics::GatewayMetrics;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tracing::{debug, warn};

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Whether a route group accepts anonymous callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePolicy {
    /// Invalid or missing credentials fall back to the anonymous tier
    Optional,
    /// Invalid or missing credentials are rejected with 401
    RequireCredential,
}

/// Resolved caller attached to admitted requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub identity: Identity,
    pub tier: Tier,
    pub remaining: u32,
    pub reset_after_secs: u64,
}

/// Credential resolution plus quota enforcement for one route group
#[derive(Clone)]
pub struct AccessGate {
    resolver: Arc<CredentialResolver>,
    quota: Arc<QuotaEnforcer>,
    metrics: Arc<GatewayMetrics>,
    policy: GatePolicy,
    trust_forwarded_headers: bool,
}

impl AccessGate {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        quota: Arc<QuotaEnforcer>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            resolver,
            quota,
            metrics,
            policy: GatePolicy::Optional,
            trust_forwarded_headers: false,
        }
    }

    /// Same resolver and counters, different policy
    pub fn with_policy(&self, policy: GatePolicy) -> Self {
        Self {
            policy,
            ..self.clone()
        }
    }

    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Decide whether a request may proceed.
    pub fn check(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        request_id: Option<String>,
    ) -> Result<AccessContext, ApiError> {
        let client_ip = extract_client_ip(headers, peer, self.trust_forwarded_headers);
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let caller = match self.resolver.resolve(authorization, client_ip) {
            Ok(caller) => caller,
            Err(err) => {
                GatewayMetrics::incr(&self.metrics.invalid_credentials);
                debug!(ip = %client_ip, error = %err, "Credential rejected");
                if self.policy == GatePolicy::RequireCredential {
                    return Err(ApiError::unauthorized(request_id, err.to_string()));
                }
                self.resolver.anonymous(client_ip)
            }
        };

        if self.policy == GatePolicy::RequireCredential && !caller.identity.is_authenticated() {
            return Err(ApiError::unauthorized(
                request_id,
                "This route requires credentials".to_string(),
            ));
        }

        match self.quota.admit(&caller.identity, &caller.tier) {
            Admission::Admitted {
                remaining,
                reset_after_secs,
                ..
            } => {
                GatewayMetrics::incr(&self.metrics.requests_admitted);
                Ok(AccessContext {
                    identity: caller.identity,
                    tier: caller.tier,
                    remaining,
                    reset_after_secs,
                })
            }
            Admission::Rejected {
                limit,
                retry_after_secs,
            } => {
                GatewayMetrics::incr(&self.metrics.requests_rejected);
                warn!(
                    identity = %caller.identity,
                    tier = %caller.tier,
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                Err(ApiError::too_many_requests(
                    request_id,
                    limit,
                    self.quota.window().as_secs(),
                    retry_after_secs,
                ))
            }
        }
    }
}

/// Axum middleware applying an [`AccessGate`]
pub async fn access_gate(
    State(gate): State<AccessGate>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone());

    match gate.check(request.headers(), peer, request_id) {
        Ok(context) => {
            let limits = [
                (RATE_LIMIT_LIMIT, context.tier.requests_per_window as u64),
                (RATE_LIMIT_REMAINING, context.remaining as u64),
                (RATE_LIMIT_RESET, context.reset_after_secs),
            ];
            request.extensions_mut().insert(context);

            let mut response = next.run(request).await;
            for (name, value) in limits {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(name), HeaderValue::from(value));
            }
            response
        }
        Err(rejection) => rejection.into_response(),
    }
}

/// Address used as the anonymous quota key.
///
/// Forwarding headers are only honoured behind a trusted proxy.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> IpAddr {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real_ip {
            return ip;
        }
    }

    peer.map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::TierLimits;
    use crate::clock::ManualClock;
    use crate::config::AuthConfig;
    use axum::http::StatusCode;
    use std::time::Duration;

    fn gate(anonymous: u32) -> AccessGate {
        let limits = TierLimits {
            anonymous,
            basic: 10,
            max: 100,
        };
        let resolver = Arc::new(CredentialResolver::new(
            &AuthConfig {
                jwt_secret: Some("gate-test-secret".into()),
                privileged_secret: Some("gate-test-privileged-secret".into()),
            },
            limits,
        ));
        let quota = Arc::new(QuotaEnforcer::new(
            Duration::from_secs(60),
            Arc::new(ManualClock::at_secs(1_200)),
        ));
        AccessGate::new(resolver, quota, Arc::new(GatewayMetrics::new()))
    }

    fn peer(last: u8) -> Option<SocketAddr> {
        Some(SocketAddr::from(([198, 51, 100, last], 40_000)))
    }

    #[test]
    fn test_anonymous_limit_enforced() {
        let gate = gate(2);
        let headers = HeaderMap::new();
        assert!(gate.check(&headers, peer(1), None).is_ok());
        let ctx = gate.check(&headers, peer(1), None).unwrap();
        assert_eq!(ctx.remaining, 0);

        let err = gate.check(&headers, peer(1), None).unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_invalid_token_falls_back_to_anonymous() {
        let gate = gate(1);
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer not-a-token"));

        let ctx = gate.check(&headers, peer(2), None).unwrap();
        assert_eq!(ctx.identity, Identity::Anonymous(IpAddr::from([198, 51, 100, 2])));

        // Same anonymous bucket as a caller with no header at all
        assert!(gate.check(&HeaderMap::new(), peer(2), None).is_err());
        assert_eq!(gate.metrics.invalid_credentials.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_required_policy_rejects_anonymous_and_invalid() {
        let gate = gate(10).with_policy(GatePolicy::RequireCredential);

        let err = gate.check(&HeaderMap::new(), peer(3), None).unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer forged"));
        let err = gate.check(&headers, peer(3), None).unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer gate-test-privileged-secret"),
        );
        let ctx = gate.check(&headers, peer(3), None).unwrap();
        assert_eq!(ctx.identity, Identity::Privileged);
        assert_eq!(ctx.tier.requests_per_window, 100);
    }

    #[test]
    fn test_forwarded_headers_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.9, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.10"));

        assert_eq!(
            extract_client_ip(&headers, peer(4), false),
            IpAddr::from([198, 51, 100, 4])
        );
        assert_eq!(
            extract_client_ip(&headers, peer(4), true),
            IpAddr::from([192, 0, 2, 9])
        );

        headers.remove("x-forwarded-for");
        assert_eq!(
            extract_client_ip(&headers, peer(4), true),
            IpAddr::from([192, 0, 2, 10])
        );
        assert_eq!(
            extract_client_ip(&HeaderMap::new(), None, true),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }
}
