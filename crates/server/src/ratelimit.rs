//! Per-domain rate limiting with a token bucket per request host.
//!
//! Buckets live in governor's keyed state; a companion last-access map
//! enforces the entry cap and the idle TTL. Governor's internal map does
//! not support key removal, so the cleanup pass rebuilds the limiter when
//! it evicted anything — idle buckets would otherwise accumulate for every
//! host ever seen.

use crate::metrics;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use pagoda_core::config::RateLimitConfig;
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

type HostLimiter = RateLimiter<String, DashMap<String, InMemoryState>, DefaultClock, NoOpMiddleware>;

/// Rejection details for a rate-limited request.
#[derive(Debug)]
pub struct RateLimited {
    pub retry_after_secs: u64,
}

struct RateLimitInner {
    limiter: RwLock<HostLimiter>,
    last_access: DashMap<String, Instant>,
    quota: Quota,
    max_entries: usize,
    entry_ttl: Duration,
}

/// Shared rate-limiter state; cheap to clone.
#[derive(Clone)]
pub struct RateLimitState {
    inner: Option<Arc<RateLimitInner>>,
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { inner: None };
        }

        let period = Duration::from_millis(config.per_domain_frequency_ms.max(1));
        let burst = NonZeroU32::new(config.per_domain_burst)
            .unwrap_or_else(|| NonZeroU32::new(40).unwrap());
        let quota = Quota::with_period(period)
            .expect("non-zero rate limit period")
            .allow_burst(burst);

        Self {
            inner: Some(Arc::new(RateLimitInner {
                limiter: RwLock::new(RateLimiter::dashmap(quota)),
                last_access: DashMap::new(),
                quota,
                max_entries: config.max_entries,
                entry_ttl: config.entry_ttl(),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Admission decision for a request host.
    pub fn host_allowed(&self, host: &str) -> Result<(), RateLimited> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let key = host.to_string();

        // Bound the tracked key set; over capacity, unknown hosts share the
        // fate of a rate-limited one rather than growing the map.
        if !inner.last_access.contains_key(&key)
            && inner.last_access.len() >= inner.max_entries
        {
            tracing::warn!(host, "rate limiter at capacity, rejecting new host");
            metrics::RATE_LIMITED_TOTAL.inc();
            return Err(RateLimited {
                retry_after_secs: 60,
            });
        }
        inner.last_access.insert(key.clone(), Instant::now());

        let limiter = inner.limiter.read().unwrap_or_else(|poisoned| {
            tracing::warn!("rate limiter lock was poisoned, recovering");
            poisoned.into_inner()
        });
        match limiter.check_key(&key) {
            Ok(_) => Ok(()),
            Err(not_until) => {
                metrics::RATE_LIMITED_TOTAL.inc();
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                Err(RateLimited {
                    retry_after_secs: wait.as_secs() + 1,
                })
            }
        }
    }

    /// Evict hosts idle past the TTL. Returns the eviction count.
    pub fn cleanup(&self) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };

        let now = Instant::now();
        let ttl = inner.entry_ttl;
        let before = inner.last_access.len();
        inner
            .last_access
            .retain(|_, last| now.duration_since(*last) <= ttl);
        let evicted = before - inner.last_access.len();

        if evicted > 0 {
            let mut limiter = inner.limiter.write().unwrap_or_else(|poisoned| {
                tracing::warn!("rate limiter lock was poisoned during rebuild, recovering");
                poisoned.into_inner()
            });
            *limiter = RateLimiter::dashmap(inner.quota);
            tracing::debug!(
                evicted,
                remaining = inner.last_access.len(),
                "rebuilt per-domain rate limiter after cleanup"
            );
        }
        evicted
    }

    pub fn entry_count(&self) -> usize {
        self.inner
            .as_ref()
            .map(|inner| inner.last_access.len())
            .unwrap_or(0)
    }
}

/// Spawn the periodic cleanup task.
pub fn spawn_cleanup_task(
    state: RateLimitState,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let evicted = state.cleanup();
            if evicted > 0 {
                tracing::info!(evicted, "rate limiter cleanup evicted idle hosts");
            }
        }
    })
}
