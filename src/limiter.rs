//! Local fixed-window rate limiting.
//!
//! Process-local and single-instance: counters are neither durable nor
//! shared across horizontally-scaled replicas. A shared store can stand
//! in behind the same `check` signature without touching callers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Seconds until the window resets, rounded up.
    pub reset_in: u64,
}

#[derive(Debug)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Keyed fixed-window request counter.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks if a new request exceeds the limit. If not, increments the
    /// counter.
    ///
    /// The dashmap entry guard keeps the increment-and-compare atomic per
    /// key, so two concurrent requests cannot both be admitted at the
    /// boundary count.
    pub fn check(
        &self,
        key: &str,
        max_requests: u32,
        window: Duration,
    ) -> Verdict {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Window {
                count: 0,
                reset_at: now + window,
            });

        // Window elapsed, replace it wholesale.
        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + window;
        }

        let reset_in = seconds_ceil(entry.reset_at - now);

        if entry.count >= max_requests {
            return Verdict {
                allowed: false,
                remaining: 0,
                reset_in,
            };
        }

        entry.count += 1;
        Verdict {
            allowed: true,
            remaining: max_requests - entry.count,
            reset_in,
        }
    }

    /// Drop entries whose window has elapsed. Bounds memory growth, not
    /// correctness: `check` replaces stale windows on its own.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, window| window.reset_at > now);
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let limiter = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                limiter.sweep();
            }
        });
    }
}

fn seconds_ceil(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}
