//! Per-client token-bucket admission control.
//!
//! Buckets are created on first sighting with a full burst allowance and
//! refill continuously at `rate_limit` tokens per second. Rejection happens
//! before a request touches the worker queue. A janitor drops buckets that
//! have been idle for longer than the cleanup interval.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::Limiter as LimiterConfig;
use crate::utils::clock;
use crate::utils::dashmap::new_dashmap;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    /// Also serves as the last-seen stamp for the janitor.
    last_refill: quanta::Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    idle_after: Duration,
    buckets: DashMap<String, Mutex<Bucket>>,
}

/// Continuous refill, capped at the bucket capacity.
fn refill(tokens: f64, elapsed_secs: f64, rate: f64, burst: f64) -> f64 {
    (tokens + elapsed_secs * rate).min(burst)
}

impl RateLimiter {
    pub fn new(config: &LimiterConfig, workers: usize) -> RateLimiter {
        RateLimiter {
            rate: config.rate_limit,
            burst: config.burst_size,
            idle_after: config.cleanup_interval.as_std(),
            buckets: new_dashmap(workers),
        }
    }

    fn take_token(&self, bucket: &Mutex<Bucket>) -> bool {
        let mut bucket = bucket.lock();
        let now = clock::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = refill(bucket.tokens, elapsed, self.rate, self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Admits or rejects one request for `client_id`. Known clients take
    /// the read path; only first sightings write to the map.
    pub fn admit(&self, client_id: &str) -> bool {
        if let Some(bucket) = self.buckets.get(client_id) {
            return self.take_token(bucket.value());
        }

        let entry = self.buckets.entry(client_id.to_string()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.burst,
                last_refill: clock::now(),
            })
        });
        self.take_token(entry.value())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn sweep(&self) -> usize {
        let before = self.buckets.len();
        let idle_after = self.idle_after;
        self.buckets
            .retain(|_, bucket| bucket.lock().last_refill.elapsed() < idle_after);
        before - self.buckets.len()
    }

    /// Background task removing idle buckets. Stops when the shutdown flag
    /// flips.
    pub async fn run_janitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.idle_after);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!("rate limiter janitor dropped {removed} idle buckets");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
