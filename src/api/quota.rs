//! Fixed-window request quotas
//!
//! One counter per identity, tagged with the window epoch
//! (`floor(unix_now / window)`) it belongs to. A counter from an older epoch is
//! reset in place on the next request and removed by [`QuotaEnforcer::sweep`].
//!
//! Every admit decision is taken while holding the `DashMap` entry lock for the
//! identity, so concurrent requests from one caller are linearized and can
//! never be admitted past capacity. Requests straddling a window boundary may
//! burst up to twice the capacity.

use super::auth::{Identity, Tier};
use crate::clock::Clock;
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// Admit/reject decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        limit: u32,
        remaining: u32,
        reset_after_secs: u64,
    },
    Rejected {
        limit: u32,
        retry_after_secs: u64,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Per-identity counter for one window epoch
#[derive(Debug, Clone, Copy)]
struct QuotaCounter {
    epoch: u64,
    count: u32,
}

/// Owner of all quota counters
pub struct QuotaEnforcer {
    counters: DashMap<Identity, QuotaCounter>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl QuotaEnforcer {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            window: window.max(Duration::from_secs(1)),
            clock,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request for `identity` against `tier`'s capacity.
    pub fn admit(&self, identity: &Identity, tier: &Tier) -> Admission {
        let (epoch, reset_after_secs) = self.current_epoch();
        let limit = tier.requests_per_window;

        let mut counter = self
            .counters
            .entry(identity.clone())
            .or_insert(QuotaCounter { epoch, count: 0 });

        if counter.epoch != epoch {
            counter.epoch = epoch;
            counter.count = 0;
        }

        if counter.count < limit {
            counter.count += 1;
            Admission::Admitted {
                limit,
                remaining: limit - counter.count,
                reset_after_secs,
            }
        } else {
            Admission::Rejected {
                limit,
                retry_after_secs: reset_after_secs,
            }
        }
    }

    /// Drop counters whose window has passed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let (epoch, _) = self.current_epoch();
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.epoch >= epoch);
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, active = self.counters.len(), "Swept expired quota counters");
        }
        removed
    }

    /// Number of identities with a live counter
    pub fn tracked_identities(&self) -> usize {
        self.counters.len()
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval until the task is aborted.
    pub fn start_sweep_task(enforcer: Arc<QuotaEnforcer>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                enforcer.sweep();
            }
        })
    }

    /// Current epoch and whole seconds left until it ends (at least 1)
    fn current_epoch(&self) -> (u64, u64) {
        let now_ms = self.clock.unix_now().as_millis() as u64;
        let window_ms = self.window.as_millis() as u64;
        let epoch = now_ms / window_ms;
        let remaining_ms = (epoch + 1) * window_ms - now_ms;
        (epoch, remaining_ms.div_ceil(1_000).max(1))
    }
}
