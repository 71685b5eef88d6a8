//! Caller credentials and access tiers
//!
//! Resolves the `Authorization` header of a request to an [`Identity`] and a
//! [`Tier`]:
//! - no header: anonymous bucket keyed by the caller's address
//! - `Bearer <privileged secret>`: the fixed privileged bucket at the highest tier
//! - `Bearer <HS256 token>`: the token subject at the tier named by its `tier` claim
//!
//! Token capacities are clamped to `max_requests_per_window` so a forged or
//! oversized claim can never lift the quota ceiling.

use crate::config::{AuthConfig, RateLimitConfig};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, net::IpAddr, time::Duration};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

/// Principal a quota is tracked against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Caller without credentials, keyed by network address
    Anonymous(IpAddr),
    /// Subject id taken from a verified token
    Subject(String),
    /// Holder of the static shared secret
    Privileged,
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Identity::Anonymous(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Anonymous(ip) => write!(f, "ip:{}", ip),
            Identity::Subject(sub) => write!(f, "sub:{}", sub),
            Identity::Privileged => write!(f, "privileged"),
        }
    }
}

/// Access class named by a token's `tier` claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierClass {
    Anonymous,
    Basic,
    Pro,
}

/// Access tier with its resolved per-window capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tier {
    pub class: TierClass,
    pub requests_per_window: u32,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            TierClass::Anonymous => write!(f, "anonymous"),
            TierClass::Basic => write!(f, "basic"),
            TierClass::Pro => write!(f, "pro-{}", self.requests_per_window),
        }
    }
}

/// Capacities of the statically configured tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub anonymous: u32,
    pub basic: u32,
    /// Ceiling for any declared capacity; also the highest tier
    pub max: u32,
}

impl From<&RateLimitConfig> for TierLimits {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            anonymous: config.anonymous_requests,
            basic: config.basic_requests,
            max: config.max_requests_per_window,
        }
    }
}

impl TierLimits {
    pub fn anonymous(&self) -> Tier {
        Tier {
            class: TierClass::Anonymous,
            requests_per_window: self.anonymous,
        }
    }

    pub fn highest(&self) -> Tier {
        Tier {
            class: TierClass::Pro,
            requests_per_window: self.max,
        }
    }

    /// Parse a tier label (`anonymous`, `basic`, `pro-N`), clamping `N` to `max`.
    pub fn parse(&self, label: &str) -> Result<Tier, CredentialError> {
        match label {
            "anonymous" => Ok(self.anonymous()),
            "basic" => Ok(Tier {
                class: TierClass::Basic,
                requests_per_window: self.basic,
            }),
            other => {
                let unknown =
                    || CredentialError::InvalidCredential(format!("unknown tier '{}'", other));
                let digits = other
                    .strip_prefix("pro-")
                    .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                    .ok_or_else(unknown)?;
                // Digits beyond u64 can only mean more than the ceiling
                let declared = digits.parse::<u64>().unwrap_or(u64::MAX);
                if declared == 0 {
                    return Err(unknown());
                }

                let clamped = declared.min(self.max as u64) as u32;
                if declared > self.max as u64 {
                    warn!(declared, max = self.max, "Clamping declared tier capacity");
                }

                Ok(Tier {
                    class: TierClass::Pro,
                    requests_per_window: clamped,
                })
            }
        }
    }
}

/// Claims carried by a signed tier token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Stable subject id
    pub sub: String,
    /// Tier label, e.g. `basic` or `pro-240`
    pub tier: String,
    /// Expiration (Unix seconds)
    pub exp: u64,
    /// Issued at (Unix seconds)
    #[serde(default)]
    pub iat: Option<u64>,
}

/// Outcome of credential resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCaller {
    pub identity: Identity,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

/// Read-only verifier for request authorization material
#[derive(Clone)]
pub struct CredentialResolver {
    limits: TierLimits,
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    privileged_digest: Option<[u8; 32]>,
}

impl CredentialResolver {
    pub fn new(auth: &AuthConfig, limits: TierLimits) -> Self {
        Self {
            limits,
            decoding_key: auth
                .jwt_secret
                .as_ref()
                .map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            validation: token_validation(),
            privileged_digest: auth.privileged_secret.as_deref().map(digest),
        }
    }

    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    /// Anonymous treatment for a caller address
    pub fn anonymous(&self, peer: IpAddr) -> ResolvedCaller {
        ResolvedCaller {
            identity: Identity::Anonymous(peer),
            tier: self.limits.anonymous(),
        }
    }

    /// Resolve the raw `Authorization` header value, if any.
    pub fn resolve(
        &self,
        authorization: Option<&str>,
        peer: IpAddr,
    ) -> Result<ResolvedCaller, CredentialError> {
        let Some(header) = authorization.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(self.anonymous(peer));
        };

        let credential = bearer_value(header).ok_or_else(|| {
            CredentialError::InvalidCredential("unsupported authorization scheme".to_string())
        })?;

        if self.matches_privileged(credential) {
            return Ok(ResolvedCaller {
                identity: Identity::Privileged,
                tier: self.limits.highest(),
            });
        }

        let claims = self.verify_token(credential)?;
        let tier = self.limits.parse(&claims.tier)?;
        debug!(subject = %claims.sub, tier = %tier, "Resolved token credential");

        Ok(ResolvedCaller {
            identity: Identity::Subject(claims.sub),
            tier,
        })
    }

    fn matches_privileged(&self, credential: &str) -> bool {
        match &self.privileged_digest {
            Some(expected) => bool::from(expected[..].ct_eq(&digest(credential)[..])),
            None => false,
        }
    }

    fn verify_token(&self, token: &str) -> Result<TokenClaims, CredentialError> {
        let key = self.decoding_key.as_ref().ok_or_else(|| {
            CredentialError::InvalidCredential("token authentication is disabled".to_string())
        })?;

        let data = decode::<TokenClaims>(token, key, &self.validation)
            .map_err(|e| CredentialError::InvalidCredential(e.to_string()))?;

        if data.claims.sub.trim().is_empty() {
            return Err(CredentialError::InvalidCredential(
                "token subject is empty".to_string(),
            ));
        }

        Ok(data.claims)
    }
}

/// Mints signed tier tokens with the configured secret
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    limits: TierLimits,
}

impl TokenIssuer {
    pub fn new(secret: &str, limits: TierLimits) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            limits,
        }
    }

    pub fn issue(&self, subject: &str, tier: &str, ttl: Duration) -> Result<String, CredentialError> {
        if subject.trim().is_empty() {
            return Err(CredentialError::InvalidCredential(
                "token subject is empty".to_string(),
            ));
        }
        self.limits.parse(tier)?;

        let now = Utc::now().timestamp().max(0) as u64;
        let claims = TokenClaims {
            sub: subject.to_string(),
            tier: tier.to_string(),
            exp: now + ttl.as_secs(),
            iat: Some(now),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| CredentialError::InvalidCredential(e.to_string()))
    }
}

fn token_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp", "sub"]);
    validation
}

fn bearer_value(header: &str) -> Option<&str> {
    let (scheme, value) = header.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(value.trim()).filter(|v| !v.is_empty())
    } else {
        None
    }
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}
