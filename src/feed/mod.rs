//! Real-time event relay
//!
//! upstream feed → [`WireFeedListener`] → bounded channel → [`FeedRelay`]
//! ([`EventDecoder`] then [`EventBroadcaster`]) → [`SubscriptionRegistry`] queues.
//!
//! The relay shares nothing with the HTTP access path. When the upstream
//! endpoint is absent or unreachable at startup the feed is simply disabled.

pub mod broadcaster;
pub mod decoder;
pub mod listener;
pub mod registry;
pub mod relay;

pub use broadcaster::{BroadcastReport, EventBroadcaster};
pub use decoder::{DecodedEvent, EventDecoder, FeedTopic};
pub use listener::{FeedSource, RawFeedMessage, WireFeedListener, ZmqFeedSource};
pub use registry::{ChannelSet, LiveChannel, SubscriberHandle, SubscriptionRegistry};
pub use relay::FeedRelay;

use crate::{config::FeedConfig, metrics::GatewayMetrics};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

/// Background tasks of a running feed
pub struct FeedHandle {
    pub listener: JoinHandle<()>,
    pub relay: JoinHandle<()>,
}

impl FeedHandle {
    pub fn abort(&self) {
        self.listener.abort();
        self.relay.abort();
    }
}

/// Wire any [`FeedSource`] into a listener and relay pair.
pub fn spawn_feed<S: FeedSource>(
    source: S,
    config: &FeedConfig,
    broadcaster: EventBroadcaster,
    metrics: Arc<GatewayMetrics>,
) -> FeedHandle {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let relay = FeedRelay::new(broadcaster, Arc::clone(&metrics)).spawn(rx);
    let listener = WireFeedListener::new(source, tx, config.reconnect_delay(), metrics).spawn();
    FeedHandle { listener, relay }
}

/// Connect to the configured endpoint and start relaying.
///
/// Returns `None` with the feed disabled when no endpoint is configured or
/// the endpoint cannot be reached.
pub async fn start_feed(
    config: &FeedConfig,
    broadcaster: EventBroadcaster,
    metrics: Arc<GatewayMetrics>,
) -> Option<FeedHandle> {
    let Some(endpoint) = config.endpoint.as_deref() else {
        info!("No feed endpoint configured, live feed disabled");
        return None;
    };

    match ZmqFeedSource::connect(endpoint, config.connect_timeout()).await {
        Ok(source) => Some(spawn_feed(
            source.with_idle_timeout(config.idle_timeout()),
            config,
            broadcaster,
            metrics,
        )),
        Err(e) => {
            warn!(endpoint, error = %e, "Upstream feed unavailable, live feed disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster(metrics: &Arc<GatewayMetrics>) -> EventBroadcaster {
        let registry = Arc::new(SubscriptionRegistry::new(8, 8, Arc::clone(metrics)));
        EventBroadcaster::new(registry, Arc::clone(metrics))
    }

    #[tokio::test]
    async fn test_no_endpoint_disables_feed() {
        let metrics = Arc::new(GatewayMetrics::new());
        let config = FeedConfig {
            endpoint: None,
            ..FeedConfig::default()
        };
        assert!(start_feed(&config, broadcaster(&metrics), metrics).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_disables_feed() {
        let metrics = Arc::new(GatewayMetrics::new());
        let config = FeedConfig {
            endpoint: Some("tcp://127.0.0.1:1".into()),
            connect_timeout_ms: 100,
            ..FeedConfig::default()
        };
        assert!(start_feed(&config, broadcaster(&metrics), metrics).await.is_none());
    }
}
