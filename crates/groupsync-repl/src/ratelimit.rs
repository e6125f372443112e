//! Outbound call admission control.
//!
//! Bounds the number of remote calls issued within a trailing window, shared
//! by every replication loop that talks to a remote service with the same
//! credential. Counting is done in fixed buckets keyed by
//! `floor(elapsed_ms / timestep_ms)`; the window sum covers every bucket whose
//! key falls within `[now - timestep, now]`, so a burst straddling a bucket
//! boundary can briefly exceed the nominal rate.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default interval between admission checks while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// A single request asked for more queries than one window allows.
    #[error("requested {requested} queries but the quota is {quota} per window")]
    ExceedsQuota {
        /// Queries requested.
        requested: u64,
        /// Configured per-window quota.
        quota: u64,
    },
}

/// Fixed-bucket sliding-window rate limiter.
pub struct RateLimiter {
    quota: u64,
    timestep_ms: u64,
    poll_interval: Duration,
    epoch: Instant,
    buckets: Mutex<BTreeMap<u64, u64>>,
    hits: AtomicU64,
}

impl RateLimiter {
    /// Allow `queries_per_timestep` calls per `timestep_ms` window.
    pub fn new(queries_per_timestep: u64, timestep_ms: u64) -> Self {
        Self {
            quota: queries_per_timestep,
            timestep_ms: timestep_ms.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            epoch: Instant::now(),
            buckets: Mutex::new(BTreeMap::new()),
            hits: AtomicU64::new(0),
        }
    }

    /// Override how often a waiting caller re-checks admission.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Per-window quota.
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Window length in milliseconds.
    pub fn timestep_ms(&self) -> u64 {
        self.timestep_ms
    }

    /// Wait until `count` more queries fit in the current window, then
    /// account for them.
    ///
    /// Fails immediately if `count` can never fit.
    pub async fn want_queries(&self, count: u64) -> Result<(), RateLimitError> {
        if count > self.quota {
            return Err(RateLimitError::ExceedsQuota {
                requested: count,
                quota: self.quota,
            });
        }

        loop {
            let in_window = {
                let mut buckets = self.buckets.lock().await;
                let now_ms = self.elapsed_ms();
                let sum = self.purge_and_sum(&mut buckets, now_ms);
                if sum + count <= self.quota {
                    *buckets.entry(now_ms / self.timestep_ms).or_insert(0) += count;
                    debug!(count, in_window = sum + count, quota = self.quota, "queries admitted");
                    return Ok(());
                }
                sum
            };

            warn!(
                count,
                in_window,
                quota = self.quota,
                wait_ms = self.poll_interval.as_millis() as u64,
                "rate limit reached, waiting"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Record that the remote side signalled throttling. Observability only.
    pub fn rate_limit_hit(&self) {
        let total = self.hits.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(total_hits = total, "remote service reported rate limiting");
    }

    /// Number of times [`RateLimiter::rate_limit_hit`] has been called.
    pub fn rate_limit_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Queries accounted to the current window.
    pub async fn queries_in_window(&self) -> u64 {
        let mut buckets = self.buckets.lock().await;
        let now_ms = self.elapsed_ms();
        self.purge_and_sum(&mut buckets, now_ms)
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn purge_and_sum(&self, buckets: &mut BTreeMap<u64, u64>, now_ms: u64) -> u64 {
        let window_start = now_ms.saturating_sub(self.timestep_ms) / self.timestep_ms;
        buckets.retain(|key, _| *key >= window_start);
        buckets.values().sum()
    }
}

/// Hands out one shared limiter per remote credential.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: StdMutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter for `credential`, created with the given quota on first use.
    /// Later calls for the same credential share the first limiter.
    pub fn get_or_create(
        &self,
        credential: &str,
        queries_per_timestep: u64,
        timestep_ms: u64,
    ) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = limiters.get(credential) {
            if existing.quota() != queries_per_timestep || existing.timestep_ms() != timestep_ms {
                warn!(
                    credential,
                    quota = existing.quota(),
                    timestep_ms = existing.timestep_ms(),
                    "conflicting rate limit for shared credential, keeping first"
                );
            }
            return Arc::clone(existing);
        }
        let limiter = Arc::new(RateLimiter::new(queries_per_timestep, timestep_ms));
        limiters.insert(credential.to_string(), Arc::clone(&limiter));
        limiter
    }

    /// Number of distinct credentials.
    pub fn len(&self) -> usize {
        self.limiters.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// True if no limiter has been created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
