//! Live subscriber registry
//!
//! Each subscriber owns a bounded outbound queue. The registry keeps the
//! sending halves keyed by connection id; broadcasts take a snapshot of the
//! matching senders so joins and leaves never contend with an in-flight
//! fan-out.

use crate::metrics::GatewayMetrics;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Logical event channels offered to live subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveChannel {
    Transactions,
    Blocks,
}

impl LiveChannel {
    pub const ALL: [LiveChannel; 2] = [LiveChannel::Transactions, LiveChannel::Blocks];

    pub fn as_str(&self) -> &'static str {
        match self {
            LiveChannel::Transactions => "transactions",
            LiveChannel::Blocks => "blocks",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim() {
            "transactions" => Some(LiveChannel::Transactions),
            "blocks" => Some(LiveChannel::Blocks),
            _ => None,
        }
    }
}

/// Subset of [`LiveChannel`]s a subscriber receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet {
    transactions: bool,
    blocks: bool,
}

impl ChannelSet {
    pub fn all() -> Self {
        Self {
            transactions: true,
            blocks: true,
        }
    }

    pub fn only(channel: LiveChannel) -> Self {
        Self::from_iter([channel])
    }

    /// Parse a comma separated list such as `transactions,blocks`.
    ///
    /// Unknown names are ignored; an empty result is `None`.
    pub fn parse_list(list: &str) -> Option<Self> {
        let set: Self = list.split(',').filter_map(LiveChannel::parse).collect();
        (!set.is_empty()).then_some(set)
    }

    pub fn contains(&self, channel: LiveChannel) -> bool {
        match channel {
            LiveChannel::Transactions => self.transactions,
            LiveChannel::Blocks => self.blocks,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.transactions && !self.blocks
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<LiveChannel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = LiveChannel>>(iter: I) -> Self {
        let mut set = Self {
            transactions: false,
            blocks: false,
        };
        for channel in iter {
            match channel {
                LiveChannel::Transactions => set.transactions = true,
                LiveChannel::Blocks => set.blocks = true,
            }
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("subscriber limit of {max} reached")]
    Full { max: usize },
}

/// Connection id returned by [`SubscriptionRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

impl std::fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Registered subscriber: its channels and the sending half of its queue
#[derive(Debug)]
pub struct Subscriber {
    handle: SubscriberHandle,
    channels: ChannelSet,
    sender: mpsc::Sender<Arc<str>>,
}

impl Subscriber {
    #[inline]
    pub fn handle(&self) -> SubscriberHandle {
        self.handle
    }

    #[inline]
    pub fn wants(&self, channel: LiveChannel) -> bool {
        self.channels.contains(channel)
    }

    /// Enqueue without waiting on the consumer.
    #[inline]
    pub fn try_send(&self, message: Arc<str>) -> Result<(), mpsc::error::TrySendError<Arc<str>>> {
        self.sender.try_send(message)
    }
}

pub struct SubscriptionRegistry {
    subscribers: DashMap<u64, Arc<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    max_subscribers: usize,
    metrics: Arc<GatewayMetrics>,
}

impl SubscriptionRegistry {
    /// `buffer` bounds each subscriber's queue; `max_subscribers` caps the set.
    pub fn new(buffer: usize, max_subscribers: usize, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            max_subscribers,
            metrics,
        }
    }

    /// Add a subscriber and hand back the receiving half of its queue.
    pub fn register(
        &self,
        channels: ChannelSet,
    ) -> Result<(SubscriberHandle, mpsc::Receiver<Arc<str>>), RegistryError> {
        if self.subscribers.len() >= self.max_subscribers {
            return Err(RegistryError::Full {
                max: self.max_subscribers,
            });
        }

        let handle = SubscriberHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.subscribers.insert(
            handle.0,
            Arc::new(Subscriber {
                handle,
                channels,
                sender,
            }),
        );
        self.publish_count();

        debug!(subscriber = %handle, ?channels, "Subscriber registered");
        Ok((handle, receiver))
    }

    /// Remove a subscriber. Returns false when it was already gone.
    pub fn unregister(&self, handle: SubscriberHandle) -> bool {
        let removed = self.subscribers.remove(&handle.0).is_some();
        if removed {
            self.publish_count();
            debug!(subscriber = %handle, "Subscriber unregistered");
        }
        removed
    }

    /// Subscribers currently interested in `channel`
    pub fn snapshot(&self, channel: LiveChannel) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .iter()
            .filter(|entry| entry.value().wants(channel))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    fn publish_count(&self) {
        self.metrics
            .live_subscribers
            .store(self.subscribers.len() as u64, Ordering::Relaxed);
    }
}
