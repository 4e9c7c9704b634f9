//! Per-client fixed-window admission control
//!
//! Each client key gets a counter that resets when its window expires. A
//! client can burst up to twice the limit across a window boundary; that
//! imprecision is accepted, the limiter exists to stop abusive automation,
//! not to enforce fair shares.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Admission state for one client key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRecord {
    /// Requests observed in the current window, including rejected ones
    pub count: u32,
    /// When the current window ends
    pub window_reset_at: Instant,
}

/// Shared record map, injected so each limiter (and each test) can own its
/// own store.
#[derive(Debug, Clone, Default)]
pub struct RateLimitStore {
    records: Arc<DashMap<String, RateLimitRecord>>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<RateLimitRecord> {
        self.records.get(key).map(|r| *r)
    }
}

/// Why a request was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRejection {
    pub limit: u32,
    pub window: Duration,
    /// Time until the client's window resets
    pub retry_after: Duration,
}

impl From<RateLimitRejection> for crate::error::GatewayError {
    fn from(r: RateLimitRejection) -> Self {
        crate::error::GatewayError::RateLimited {
            limit: r.limit,
            window: r.window,
            retry_after: r.retry_after,
        }
    }
}

pub struct RateLimiter {
    store: RateLimitStore,
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(store: RateLimitStore, window: Duration, max_requests: u32) -> Self {
        Self {
            store,
            window,
            max_requests,
        }
    }

    pub fn from_config(store: RateLimitStore, config: &RateLimitConfig) -> Self {
        Self::new(store, config.window(), config.max_requests)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn store(&self) -> &RateLimitStore {
        &self.store
    }

    /// Admit or reject a request from `key` at the current time
    pub fn admit(&self, key: &str) -> Result<(), RateLimitRejection> {
        self.admit_at(key, Instant::now())
    }

    /// Admit or reject a request from `key` observed at `now`
    pub fn admit_at(&self, key: &str, now: Instant) -> Result<(), RateLimitRejection> {
        // The entry guard holds the shard lock, so check-and-increment is atomic
        let mut entry = self
            .store
            .records
            .entry(key.to_string())
            .or_insert(RateLimitRecord {
                count: 0,
                window_reset_at: now + self.window,
            });

        let record = entry.value_mut();
        if now >= record.window_reset_at {
            record.count = 0;
            record.window_reset_at = now + self.window;
        }
        record.count = record.count.saturating_add(1);

        if record.count > self.max_requests {
            let retry_after = record.window_reset_at.saturating_duration_since(now);
            debug!(key, count = record.count, "Rate limit exceeded");
            return Err(RateLimitRejection {
                limit: self.max_requests,
                window: self.window,
                retry_after,
            });
        }

        Ok(())
    }

    /// Remove records whose window has expired, returning how many were evicted
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.store.records.len();
        self.store.records.retain(|_, r| r.window_reset_at > now);
        before.saturating_sub(self.store.records.len())
    }

    /// Periodically evict expired records until shutdown
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = self.sweep();
                    if evicted > 0 {
                        debug!(evicted, remaining = self.store.len(), "Swept expired rate limit records");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
