//! Sequential decode-and-broadcast loop
//!
//! Consumes raw messages in arrival order. A message that fails to decode is
//! logged and dropped; the loop always moves on to the next one.
//!
//! Decoding a full block is CPU-bound, so the loop runs on the blocking pool
//! rather than on a runtime worker.

use super::{
    broadcaster::{BroadcastReport, EventBroadcaster},
    decoder::{EventDecoder, FeedTopic},
    listener::RawFeedMessage,
};
use crate::metrics::GatewayMetrics;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

pub struct FeedRelay {
    decoder: EventDecoder,
    broadcaster: EventBroadcaster,
    metrics: Arc<GatewayMetrics>,
    last_sequence: HashMap<FeedTopic, u32>,
}

impl FeedRelay {
    pub fn new(broadcaster: EventBroadcaster, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            decoder: EventDecoder::new(),
            broadcaster,
            metrics,
            last_sequence: HashMap::new(),
        }
    }

    pub fn spawn(self, messages: mpsc::Receiver<RawFeedMessage>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run(messages))
    }

    /// Process messages until the listener side of the channel closes.
    ///
    /// Blocks the calling thread; must not be called from async context.
    pub fn run(mut self, mut messages: mpsc::Receiver<RawFeedMessage>) {
        while let Some(message) = messages.blocking_recv() {
            self.process(message);
        }
        info!("Feed relay stopped");
    }

    /// Decode one message and broadcast it. `None` when it was dropped.
    pub fn process(&mut self, message: RawFeedMessage) -> Option<BroadcastReport> {
        if let Some(topic) = FeedTopic::parse(&message.topic) {
            self.count_topic(topic);
            if let Some(sequence) = message.sequence {
                self.track_sequence(topic, sequence);
            }
        }

        match self.decoder.decode(&message.topic, &message.payload) {
            Ok(event) => {
                let report = self.broadcaster.broadcast(&event);
                debug!(
                    topic = %message.topic,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "Event relayed"
                );
                Some(report)
            }
            Err(e) => {
                GatewayMetrics::incr(&self.metrics.feed_decode_errors);
                warn!(
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    error = %e,
                    "Dropping undecodable feed message"
                );
                None
            }
        }
    }

    fn count_topic(&self, topic: FeedTopic) {
        match topic {
            FeedTopic::RawTx => GatewayMetrics::incr(&self.metrics.feed_rawtx_messages),
            FeedTopic::RawBlock => GatewayMetrics::incr(&self.metrics.feed_rawblock_messages),
        }
    }

    /// Upstream numbers each topic independently; a jump means messages were
    /// lost before they reached us.
    fn track_sequence(&mut self, topic: FeedTopic, sequence: u32) {
        if let Some(previous) = self.last_sequence.insert(topic, sequence) {
            let expected = previous.wrapping_add(1);
            if sequence != expected {
                GatewayMetrics::incr(&self.metrics.feed_sequence_gaps);
                warn!(
                    topic = %topic,
                    expected,
                    received = sequence,
                    "Upstream sequence gap"
                );
            }
        }
    }
}
