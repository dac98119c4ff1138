//! Sliding-window rate limiting.
//!
//! A [`SlidingWindowLimiter`] keeps a "current" and a "previous" bucket map
//! per window, rotated when the window elapses. A client's state is carried
//! from the previous bucket into the current one while its own reset time
//! has not passed, which closes the burst-at-boundary hole of naive fixed
//! windows while keeping `hit` O(1).
//!
//! [`MultiTierLimiter`] composes N windows over one key (e.g. 15 per 5s,
//! 300 per 5m, 1000 per 1h). Callers decide the enforcement action per call
//! site: drop the message, reject the operation, or close the connection.

use starling_common::config::RateTier;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Raised by `hit` when a tier's quota would be exceeded.
#[derive(Debug, Clone, Error)]
#[error("{key} exceeded {limit} hits per {window_secs}s (tier {tier})")]
pub struct RateLimitError {
    pub key: String,
    /// Index of the offending tier.
    pub tier: usize,
    pub limit: u64,
    pub window_secs: u64,
    /// Time until the client's window resets.
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ClientWindow {
    hits: u64,
    reset_at: Instant,
}

/// One sliding window over per-key hit counts.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: u64,
    window: Duration,
    window_started: Instant,
    current: HashMap<String, ClientWindow>,
    previous: HashMap<String, ClientWindow>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_started: Instant::now(),
            current: HashMap::new(),
            previous: HashMap::new(),
        }
    }

    /// Rotate buckets for every full window that has elapsed. Clients whose
    /// reset time passed during the gap expire with the discarded bucket.
    fn rotate(&mut self, now: Instant) {
        while now.duration_since(self.window_started) >= self.window {
            self.previous = std::mem::take(&mut self.current);
            self.window_started += self.window;
        }
    }

    fn client_entry(&mut self, key: &str, now: Instant) -> &mut ClientWindow {
        self.rotate(now);
        if !self.current.contains_key(key) {
            // Carry state over from the previous bucket while the client's
            // own window is still open.
            let carried = self
                .previous
                .remove(key)
                .filter(|c| now < c.reset_at)
                .unwrap_or(ClientWindow {
                    hits: 0,
                    reset_at: now + self.window,
                });
            self.current.insert(key.to_string(), carried);
        }
        self.current.get_mut(key).expect("entry just inserted")
    }

    /// Record `n` hits for `key`; raises without mutating when the quota
    /// would be exceeded, so the count never passes `limit`.
    pub fn hit(&mut self, key: &str, n: u64) -> Result<(), RateLimitError> {
        self.hit_at(key, n, Instant::now())
    }

    /// Quota left for `key` in its open window.
    pub fn remaining(&mut self, key: &str) -> u64 {
        self.remaining_at(key, Instant::now())
    }

    fn hit_at(&mut self, key: &str, n: u64, now: Instant) -> Result<(), RateLimitError> {
        let limit = self.limit;
        let window_secs = self.window.as_secs();
        let client = self.client_entry(key, now);

        if client.hits.saturating_add(n) > limit {
            return Err(RateLimitError {
                key: key.to_string(),
                tier: 0,
                limit,
                window_secs,
                retry_after: client.reset_at.saturating_duration_since(now),
            });
        }
        client.hits += n;
        Ok(())
    }

    fn remaining_at(&mut self, key: &str, now: Instant) -> u64 {
        let limit = self.limit;
        let client = self.client_entry(key, now);
        limit.saturating_sub(client.hits)
    }

    fn reset_at(&mut self, key: &str, now: Instant) -> Instant {
        self.client_entry(key, now).reset_at
    }

    /// Fraction of the quota consumed, for picking the most-exceeded tier.
    fn utilization(&mut self, key: &str, now: Instant) -> f64 {
        let limit = self.limit.max(1);
        let client = self.client_entry(key, now);
        client.hits as f64 / limit as f64
    }
}

/// N independent sliding windows sharing one key space.
///
/// State lives behind a plain mutex that is never held across an await
/// point; every operation is a handful of map lookups.
pub struct MultiTierLimiter {
    name: &'static str,
    tiers: Mutex<Vec<SlidingWindowLimiter>>,
}

impl MultiTierLimiter {
    pub fn new(name: &'static str, tiers: &[RateTier]) -> Self {
        let tiers = tiers
            .iter()
            .map(|t| SlidingWindowLimiter::new(t.limit, Duration::from_secs(t.window_secs)))
            .collect();
        Self {
            name,
            tiers: Mutex::new(tiers),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record `n` hits against every tier. The first tier over quota raises
    /// with its index and the client's retry horizon.
    pub fn hit(&self, key: &str, n: u64) -> Result<(), RateLimitError> {
        self.hit_at(key, n, Instant::now())
    }

    fn hit_at(&self, key: &str, n: u64, now: Instant) -> Result<(), RateLimitError> {
        let mut tiers = self.tiers.lock().expect("limiter poisoned");
        for (index, tier) in tiers.iter_mut().enumerate() {
            tier.hit_at(key, n, now).map_err(|mut e| {
                e.tier = index;
                e
            })?;
        }
        Ok(())
    }

    /// Remaining quota on the most-exceeded tier.
    pub fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        let mut tiers = self.tiers.lock().expect("limiter poisoned");
        let index = most_exceeded(&mut tiers, key, now);
        tiers[index].remaining_at(key, now)
    }

    /// Reset time of the most-exceeded tier.
    pub fn reset_at(&self, key: &str) -> Instant {
        let now = Instant::now();
        let mut tiers = self.tiers.lock().expect("limiter poisoned");
        let index = most_exceeded(&mut tiers, key, now);
        tiers[index].reset_at(key, now)
    }
}

fn most_exceeded(tiers: &mut [SlidingWindowLimiter], key: &str, now: Instant) -> usize {
    let mut best = 0usize;
    let mut best_utilization = f64::MIN;
    for (index, tier) in tiers.iter_mut().enumerate() {
        let utilization = tier.utilization(key, now);
        if utilization > best_utilization {
            best = index;
            best_utilization = utilization;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(limit: u64, window_secs: u64) -> RateTier {
        RateTier { limit, window_secs }
    }

    #[test]
    fn single_tier_contract() {
        let mut limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        assert_eq!(limiter.remaining("k"), 2);
        limiter.hit("k", 1).unwrap();
        limiter.hit("k", 1).unwrap();
        assert_eq!(limiter.remaining("k"), 0);
        // The raise leaves the count untouched; it never passes the limit.
        assert!(limiter.hit("k", 1).is_err());
        assert_eq!(limiter.remaining("k"), 0);
    }

    #[test]
    fn limit_hits_within_window_then_raises() {
        let limiter = MultiTierLimiter::new("test", &[tier(5, 10)]);
        let now = Instant::now();
        for _ in 0..5 {
            limiter.hit_at("ip", 1, now).unwrap();
        }
        let err = limiter.hit_at("ip", 1, now).unwrap_err();
        assert_eq!(err.tier, 0);
        assert_eq!(err.limit, 5);
        assert_eq!(err.key, "ip");
    }

    #[test]
    fn fresh_hit_succeeds_after_window_elapses() {
        let limiter = MultiTierLimiter::new("test", &[tier(3, 10)]);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.hit_at("ip", 1, start).unwrap();
        }
        assert!(limiter.hit_at("ip", 1, start).is_err());

        // Client's own window has passed; carry-over must not apply.
        let later = start + Duration::from_secs(21);
        limiter.hit_at("ip", 1, later).unwrap();
    }

    #[test]
    fn state_carries_across_bucket_rotation() {
        let limiter = MultiTierLimiter::new("test", &[tier(10, 10)]);
        let start = Instant::now();
        limiter.hit_at("ip", 8, start).unwrap();

        // One rotation later the client's window (reset at start+10) is
        // still open at start+9s... but a rotation happened at +10? Use a
        // moment after rotation yet before the client reset.
        let after_rotation = start + Duration::from_secs(10);
        // reset_at == start + 10, so the carried state expires exactly now
        // and the client starts a fresh window.
        limiter.hit_at("ip", 10, after_rotation).unwrap();
        assert!(limiter.hit_at("ip", 1, after_rotation).is_err());
    }

    #[test]
    fn carry_over_blocks_boundary_bursts() {
        let limiter = MultiTierLimiter::new("test", &[tier(10, 10)]);
        let start = Instant::now();
        // Hit late in the first bucket; the bucket rotates at +10 but the
        // client's own reset is at +15.
        let late = start + Duration::from_secs(5);
        limiter.hit_at("ip", 10, late).unwrap();

        let just_after_rotation = start + Duration::from_secs(11);
        let err = limiter.hit_at("ip", 1, just_after_rotation).unwrap_err();
        assert!(err.retry_after <= Duration::from_secs(4));
    }

    #[test]
    fn hit_applies_to_every_tier() {
        let limiter = MultiTierLimiter::new("test", &[tier(100, 5), tier(3, 3600)]);
        let now = Instant::now();
        for _ in 0..3 {
            limiter.hit_at("ip", 1, now).unwrap();
        }
        let err = limiter.hit_at("ip", 1, now).unwrap_err();
        assert_eq!(err.tier, 1);
        assert_eq!(err.limit, 3);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = MultiTierLimiter::new("test", &[tier(1, 60)]);
        let now = Instant::now();
        limiter.hit_at("a", 1, now).unwrap();
        limiter.hit_at("b", 1, now).unwrap();
        assert!(limiter.hit_at("a", 1, now).is_err());
    }

    #[test]
    fn remaining_reports_most_exceeded_tier() {
        let limiter = MultiTierLimiter::new("test", &[tier(100, 5), tier(10, 3600)]);
        let now = Instant::now();
        for _ in 0..9 {
            limiter.hit_at("ip", 1, now).unwrap();
        }
        // Tier 1 is at 9/10, tier 0 at 9/100.
        assert_eq!(limiter.remaining("ip"), 1);
    }

    #[test]
    fn ten_events_in_ten_seconds_then_the_eleventh_rejects() {
        let limiter = MultiTierLimiter::new("event", &[tier(10, 10)]);
        let now = Instant::now();
        for _ in 0..10 {
            limiter.hit_at("client", 1, now).unwrap();
        }
        assert!(limiter.hit_at("client", 1, now).is_err());
    }
}
