//! HTTP surface of the gateway
//!
//! Versioned route groups behind the tiered access gate, plus the live event
//! WebSocket and operational endpoints.

pub mod auth;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod quota;
pub mod routes;
pub mod security;
pub mod server;
pub mod websocket;

pub use auth::{CredentialResolver, Identity, Tier, TierClass, TierLimits, TokenIssuer};
pub use quota::{Admission, QuotaEnforcer};
pub use security::{AccessContext, AccessGate, GatePolicy};
pub use server::{ApiServer, GatewayApp};
