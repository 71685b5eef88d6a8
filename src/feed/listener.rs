//! Upstream wire feed subscription
//!
//! The node publishes `rawtx` and `rawblock` messages over ZeroMQ PUB/SUB as
//! three frames: topic, payload, and a 4-byte little-endian sequence number.
//! [`WireFeedListener`] reads them from a [`FeedSource`] and forwards them, in
//! arrival order, over a bounded channel to the relay loop.

use super::decoder::FeedTopic;
use crate::{errors::FeedError, metrics::GatewayMetrics};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

/// One upstream message as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFeedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub sequence: Option<u32>,
}

impl RawFeedMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Build from the frames of one multipart message.
    ///
    /// The sequence frame is optional; a sequence frame that is not exactly
    /// four bytes is ignored.
    pub fn from_frames<I, B>(frames: I) -> Result<Self, FeedError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut frames = frames.into_iter();
        let (topic, payload) = match (frames.next(), frames.next()) {
            (Some(topic), Some(payload)) => (topic, payload),
            (Some(_), None) => return Err(FeedError::MalformedEnvelope(1)),
            _ => return Err(FeedError::MalformedEnvelope(0)),
        };

        let sequence = frames.next().and_then(|frame| {
            <[u8; 4]>::try_from(frame.as_ref())
                .ok()
                .map(u32::from_le_bytes)
        });

        Ok(Self {
            topic: String::from_utf8_lossy(topic.as_ref()).into_owned(),
            payload: payload.as_ref().to_vec(),
            sequence,
        })
    }
}

/// Source of raw upstream messages
#[async_trait]
pub trait FeedSource: Send + 'static {
    /// Wait for the next message.
    async fn recv(&mut self) -> Result<RawFeedMessage, FeedError>;

    /// Re-establish the subscription after a failure.
    async fn reconnect(&mut self) -> Result<(), FeedError>;

    fn endpoint(&self) -> &str;
}

/// [`FeedSource`] subscribed to a node's ZeroMQ publisher
///
/// A SUB socket never reports a vanished publisher, it just stops yielding.
/// Silence longer than the idle timeout is treated as a disconnect.
pub struct ZmqFeedSource {
    endpoint: String,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    socket: SubSocket,
}

impl ZmqFeedSource {
    /// Connect and subscribe to every [`FeedTopic`].
    pub async fn connect(endpoint: &str, connect_timeout: Duration) -> Result<Self, FeedError> {
        let socket = Self::open(endpoint, connect_timeout).await?;
        info!(endpoint, "📡 Subscribed to upstream feed");
        Ok(Self {
            endpoint: endpoint.to_string(),
            connect_timeout,
            idle_timeout: None,
            socket,
        })
    }

    /// Report [`FeedError::Disconnected`] after `idle` without a message.
    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    async fn open(endpoint: &str, connect_timeout: Duration) -> Result<SubSocket, FeedError> {
        let unavailable = |reason: String| FeedError::UpstreamUnavailable {
            endpoint: endpoint.to_string(),
            reason,
        };

        let mut socket = SubSocket::new();
        match tokio::time::timeout(connect_timeout, socket.connect(endpoint)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(unavailable(e.to_string())),
            Err(_) => {
                return Err(unavailable(format!(
                    "connect timed out after {}ms",
                    connect_timeout.as_millis()
                )))
            }
        }

        for topic in FeedTopic::ALL {
            socket
                .subscribe(topic.as_str())
                .await
                .map_err(|e| unavailable(e.to_string()))?;
        }
        Ok(socket)
    }
}

#[async_trait]
impl FeedSource for ZmqFeedSource {
    async fn recv(&mut self) -> Result<RawFeedMessage, FeedError> {
        let received = match self.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, self.socket.recv())
                .await
                .map_err(|_| {
                    FeedError::Disconnected(format!("no message for {}ms", idle.as_millis()))
                })?,
            None => self.socket.recv().await,
        };
        let message = received.map_err(|e| FeedError::Disconnected(e.to_string()))?;
        RawFeedMessage::from_frames(message.into_vec())
    }

    async fn reconnect(&mut self) -> Result<(), FeedError> {
        self.socket = Self::open(&self.endpoint, self.connect_timeout).await?;
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Reads a [`FeedSource`] and forwards messages to the relay
pub struct WireFeedListener<S> {
    source: S,
    sink: mpsc::Sender<RawFeedMessage>,
    reconnect_delay: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl<S: FeedSource> WireFeedListener<S> {
    pub fn new(
        source: S,
        sink: mpsc::Sender<RawFeedMessage>,
        reconnect_delay: Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            source,
            sink,
            reconnect_delay,
            metrics,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the source closes or the relay drops its receiver.
    ///
    /// Runtime disconnects are retried every `reconnect_delay`.
    pub async fn run(mut self) {
        loop {
            match self.source.recv().await {
                Ok(message) => {
                    if self.sink.send(message).await.is_err() {
                        debug!("Relay stopped, listener exiting");
                        return;
                    }
                }
                Err(FeedError::MalformedEnvelope(frames)) => {
                    warn!(frames, "Skipping malformed upstream envelope");
                }
                Err(FeedError::Closed) => {
                    info!(endpoint = self.source.endpoint(), "Upstream feed closed");
                    return;
                }
                Err(e) => {
                    warn!(endpoint = self.source.endpoint(), error = %e, "Upstream feed disconnected");
                    if !self.reconnect().await {
                        return;
                    }
                }
            }
        }
    }

    /// Retry until reconnected. Returns false if the relay went away meanwhile.
    async fn reconnect(&mut self) -> bool {
        loop {
            tokio::time::sleep(self.reconnect_delay).await;
            if self.sink.is_closed() {
                return false;
            }

            match self.source.reconnect().await {
                Ok(()) => {
                    GatewayMetrics::incr(&self.metrics.feed_reconnects);
                    info!(endpoint = self.source.endpoint(), "🔄 Reconnected to upstream feed");
                    return true;
                }
                Err(e) => {
                    warn!(
                        endpoint = self.source.endpoint(),
                        error = %e,
                        retry_in_ms = self.reconnect_delay.as_millis() as u64,
                        "Reconnect failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted source: yields queued results, then reports closed
    struct ScriptedSource {
        script: VecDeque<Result<RawFeedMessage, FeedError>>,
        reconnect_failures: usize,
    }

    #[async_trait]
    impl FeedSource for ScriptedSource {
        async fn recv(&mut self) -> Result<RawFeedMessage, FeedError> {
            self.script.pop_front().unwrap_or(Err(FeedError::Closed))
        }

        async fn reconnect(&mut self) -> Result<(), FeedError> {
            if self.reconnect_failures > 0 {
                self.reconnect_failures -= 1;
                return Err(FeedError::Disconnected("still down".into()));
            }
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "scripted"
        }
    }

    #[test]
    fn test_frames_with_sequence() {
        let frames: Vec<&[u8]> = vec![b"rawtx", &[0xde, 0xad], &[7, 0, 0, 0]];
        let message = RawFeedMessage::from_frames(frames).unwrap();
        assert_eq!(message.topic, "rawtx");
        assert_eq!(message.payload, vec![0xde, 0xad]);
        assert_eq!(message.sequence, Some(7));
    }

    #[test]
    fn test_frames_without_sequence() {
        let frames: Vec<&[u8]> = vec![b"rawblock", &[1], &[1, 2]];
        let message = RawFeedMessage::from_frames(frames).unwrap();
        assert_eq!(message.sequence, None);

        let short: Vec<&[u8]> = vec![b"rawtx"];
        assert!(matches!(
            RawFeedMessage::from_frames(short),
            Err(FeedError::MalformedEnvelope(1))
        ));
    }

    #[tokio::test]
    async fn test_listener_preserves_order_and_reconnects() {
        let metrics = Arc::new(GatewayMetrics::new());
        let source = ScriptedSource {
            script: VecDeque::from(vec![
                Ok(RawFeedMessage::new("rawtx", vec![1])),
                Err(FeedError::MalformedEnvelope(0)),
                Err(FeedError::Disconnected("reset".into())),
                Ok(RawFeedMessage::new("rawblock", vec![2])),
                Ok(RawFeedMessage::new("rawtx", vec![3])),
            ]),
            reconnect_failures: 2,
        };
        let (tx, mut rx) = mpsc::channel(8);
        let handle = WireFeedListener::new(source, tx, Duration::from_millis(5), Arc::clone(&metrics))
            .spawn();

        let mut payloads = Vec::new();
        while let Some(message) = rx.recv().await {
            payloads.push(message.payload[0]);
        }
        handle.await.unwrap();

        assert_eq!(payloads, vec![1, 2, 3]);
        assert_eq!(metrics.feed_reconnects.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_listener_stops_when_relay_drops() {
        let source = ScriptedSource {
            script: (0..10)
                .map(|i| Ok(RawFeedMessage::new("rawtx", vec![i])))
                .collect(),
            reconnect_failures: 0,
        };
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = WireFeedListener::new(source, tx, Duration::from_millis(1), Arc::new(GatewayMetrics::new()))
            .spawn();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_publisher_is_reported_as_disconnected() {
        use zeromq::{PubSocket, SocketSend, ZmqMessage};

        let mut publisher = PubSocket::new();
        let bound = publisher.bind("tcp://127.0.0.1:0").await.unwrap();
        let mut source = ZmqFeedSource::connect(&bound.to_string(), Duration::from_secs(2))
            .await
            .unwrap()
            .with_idle_timeout(Some(Duration::from_millis(300)));

        // Keep publishing until the subscription has reached the publisher
        let publishing = tokio::spawn(async move {
            loop {
                let mut message = ZmqMessage::from("rawtx");
                message.push_back(vec![0xab_u8].into());
                let _ = publisher.send(message).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let first = tokio::time::timeout(Duration::from_secs(5), source.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.topic, "rawtx");
        assert_eq!(first.payload, vec![0xab]);

        publishing.abort();
        let _ = publishing.await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(e) = source.recv().await {
                    return e;
                }
            }
        })
        .await
        .expect("dropped publisher was never reported");
        assert!(matches!(outcome, FeedError::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_unavailable() {
        let result = ZmqFeedSource::connect("tcp://127.0.0.1:1", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(FeedError::UpstreamUnavailable { .. })));
    }
}
