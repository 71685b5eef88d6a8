//! bchgate - BCH REST gateway core
//!
//! Two independent paths share one process:
//! - [`api`]: tiered access control in front of the versioned `/v2` route
//!   groups (credential resolution, fixed-window quotas, 429 responses)
//! - [`feed`]: the real-time relay that decodes the node's raw transaction and
//!   block feed and fans events out to live WebSocket subscribers

pub mod api;
pub mod clock;
pub mod config;
pub mod errors;
pub mod feed;
pub mod metrics;

pub use config::{ConfigLoader, GatewayConfig};
pub use errors::{GatewayError, GatewayResult};
