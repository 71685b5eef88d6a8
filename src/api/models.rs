//! API Response Models

use serde::{Deserialize, Serialize};

/// GET /v2/health-check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Whether the upstream feed is connected and relaying
    pub feed: bool,
    /// Live subscribers currently registered
    pub subscribers: usize,
}

/// Body returned by route-group roots and `/`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// GET /v2/access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessResponse {
    pub identity: String,
    pub authenticated: bool,
    pub tier: String,
    pub requests_per_window: u32,
    pub window_seconds: u64,
    pub remaining: u32,
    pub reset_after_secs: u64,
}
