//! Fan-out of decoded events to live subscribers

use super::{
    decoder::DecodedEvent,
    registry::{LiveChannel, SubscriptionRegistry},
};
use crate::metrics::GatewayMetrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error};

/// Wire message delivered to subscribers
#[derive(Debug, Serialize)]
struct LiveMessage<'a> {
    channel: LiveChannel,
    data: &'a DecodedEvent,
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Queued to a subscriber
    pub delivered: usize,
    /// Subscriber queue was full
    pub dropped: usize,
    /// Subscriber had gone away and was unregistered
    pub closed: usize,
}

#[derive(Clone)]
pub struct EventBroadcaster {
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Deliver `event` to every subscriber of its channel.
    ///
    /// Never waits on a consumer: a full queue drops the message for that
    /// subscriber only, a closed queue unregisters the subscriber.
    pub fn broadcast(&self, event: &DecodedEvent) -> BroadcastReport {
        let channel = event.channel();
        let mut report = BroadcastReport::default();

        let subscribers = self.registry.snapshot(channel);
        if subscribers.is_empty() {
            return report;
        }

        let message: Arc<str> = match serde_json::to_string(&LiveMessage {
            channel,
            data: event,
        }) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(channel = channel.as_str(), error = %e, "Failed to serialize live event");
                return report;
            }
        };

        for subscriber in subscribers {
            match subscriber.try_send(Arc::clone(&message)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    debug!(subscriber = %subscriber.handle(), "Subscriber saturated, event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    report.closed += 1;
                    self.registry.unregister(subscriber.handle());
                }
            }
        }

        GatewayMetrics::incr(&self.metrics.events_broadcast);
        GatewayMetrics::add(&self.metrics.deliveries, report.delivered as u64);
        GatewayMetrics::add(&self.metrics.deliveries_dropped, report.dropped as u64);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::decoder::{tests::genesis_block, tests::genesis_tx, EventDecoder};
    use crate::feed::registry::ChannelSet;

    fn setup(buffer: usize) -> EventBroadcaster {
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(SubscriptionRegistry::new(buffer, 100, Arc::clone(&metrics)));
        EventBroadcaster::new(registry, metrics)
    }

    fn tx_event() -> DecodedEvent {
        EventDecoder::new().decode("rawtx", &genesis_tx()).unwrap()
    }

    #[tokio::test]
    async fn test_delivers_to_every_subscriber() {
        let broadcaster = setup(8);
        let mut receivers: Vec<_> = (0..3)
            .map(|_| broadcaster.registry().register(ChannelSet::all()).unwrap().1)
            .collect();

        let report = broadcaster.broadcast(&tx_event());
        assert_eq!(report.delivered, 3);

        for rx in receivers.iter_mut() {
            let message = rx.recv().await.unwrap();
            let json: serde_json::Value = serde_json::from_str(&message).unwrap();
            assert_eq!(json["channel"], "transactions");
            assert_eq!(json["data"]["type"], "transaction");
            assert_eq!(
                json["data"]["txid"],
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
            );
        }
    }

    #[tokio::test]
    async fn test_saturated_subscriber_does_not_block_others() {
        let broadcaster = setup(1);
        let (_slow, _slow_rx) = broadcaster.registry().register(ChannelSet::all()).unwrap();
        let (_fast, mut fast_rx) = broadcaster.registry().register(ChannelSet::all()).unwrap();

        let event = tx_event();
        assert_eq!(broadcaster.broadcast(&event).delivered, 2);
        assert!(fast_rx.recv().await.is_some());

        let report = broadcaster.broadcast(&event);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert!(fast_rx.recv().await.is_some());
        assert_eq!(broadcaster.registry().count(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_is_pruned() {
        let broadcaster = setup(4);
        let (_gone, gone_rx) = broadcaster.registry().register(ChannelSet::all()).unwrap();
        let (_live, mut live_rx) = broadcaster.registry().register(ChannelSet::all()).unwrap();
        drop(gone_rx);

        let report = broadcaster.broadcast(&tx_event());
        assert_eq!(report.closed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(broadcaster.registry().count(), 1);
        assert!(live_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_channel_filtering() {
        let broadcaster = setup(4);
        let (_t, mut tx_rx) = broadcaster
            .registry()
            .register(ChannelSet::only(LiveChannel::Transactions))
            .unwrap();

        let block = EventDecoder::new().decode("rawblock", &genesis_block()).unwrap();
        assert_eq!(broadcaster.broadcast(&block), BroadcastReport::default());
        assert!(tx_rx.try_recv().is_err());
    }
}
