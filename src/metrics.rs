//! Gateway counters with Prometheus text export

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared by the access gate and the feed path
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub requests_admitted: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub invalid_credentials: AtomicU64,

    pub feed_rawtx_messages: AtomicU64,
    pub feed_rawblock_messages: AtomicU64,
    pub feed_decode_errors: AtomicU64,
    pub feed_sequence_gaps: AtomicU64,
    pub feed_reconnects: AtomicU64,

    pub events_broadcast: AtomicU64,
    pub deliveries: AtomicU64,
    pub deliveries_dropped: AtomicU64,
    pub live_subscribers: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn to_prometheus_format(&self) -> String {
        let rows: [(&str, &str, &str, &AtomicU64); 12] = [
            ("bchgate_requests_admitted_total", "counter", "Requests admitted by the access gate", &self.requests_admitted),
            ("bchgate_requests_rejected_total", "counter", "Requests rejected for exceeding quota", &self.requests_rejected),
            ("bchgate_invalid_credentials_total", "counter", "Requests carrying unverifiable credentials", &self.invalid_credentials),
            ("bchgate_feed_rawtx_total", "counter", "Raw transaction messages received from upstream", &self.feed_rawtx_messages),
            ("bchgate_feed_rawblock_total", "counter", "Raw block messages received from upstream", &self.feed_rawblock_messages),
            ("bchgate_feed_decode_errors_total", "counter", "Upstream messages dropped as undecodable", &self.feed_decode_errors),
            ("bchgate_feed_sequence_gaps_total", "counter", "Upstream sequence gaps detected", &self.feed_sequence_gaps),
            ("bchgate_feed_reconnects_total", "counter", "Upstream reconnections", &self.feed_reconnects),
            ("bchgate_events_broadcast_total", "counter", "Decoded events broadcast", &self.events_broadcast),
            ("bchgate_deliveries_total", "counter", "Events queued to subscribers", &self.deliveries),
            ("bchgate_deliveries_dropped_total", "counter", "Events dropped for saturated subscribers", &self.deliveries_dropped),
            ("bchgate_live_subscribers", "gauge", "Currently registered live subscribers", &self.live_subscribers),
        ];

        let mut output = String::new();
        for (name, kind, help, value) in rows {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {}\n\n",
                value.load(Ordering::Relaxed)
            );
        }
        output
    }
}
