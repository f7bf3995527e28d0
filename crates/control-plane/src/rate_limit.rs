use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_seconds: u64,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0,
        }
    }
}

/// Token-bucket limiter keyed by an opaque scope string (`device:<uuid>` or
/// `ip:<addr>`). Pluggable so a shared backend can replace the in-process
/// implementation without touching callers.
pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str, burst: u32, per_minute: u32) -> RateDecision;
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn consume(&mut self, now: Instant) -> RateDecision {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return RateDecision::allow();
        }
        let missing = 1.0 - self.tokens;
        let retry_after = if self.refill_rate > 0.0 {
            (missing / self.refill_rate).ceil().max(1.0) as u64
        } else {
            60
        };
        RateDecision {
            allowed: false,
            retry_after_seconds: retry_after,
        }
    }
}

struct BucketEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// In-process bucket map. State is per process: under horizontal scale the
/// effective limit multiplies by the replica count, so a front-proxy
/// limiter is expected in production.
pub struct InMemoryRateLimiter {
    buckets: Mutex<HashMap<String, BucketEntry>>,
    max_entries: usize,
    stale_after_seconds: u64,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_entries: 50_000,
            stale_after_seconds: 3_600,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn prune(map: &mut HashMap<String, BucketEntry>, now: Instant, max: usize, stale: u64) {
        if map.len() <= max {
            return;
        }
        map.retain(|_, entry| now.duration_since(entry.last_seen).as_secs() < stale);
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn check(&self, key: &str, burst: u32, per_minute: u32) -> RateDecision {
        let now = Instant::now();
        let capacity = f64::from(burst.max(1));
        let refill_rate = f64::from(per_minute.max(1)) / 60.0;

        let mut buckets = self.buckets.lock();
        let entry = buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketEntry {
                bucket: TokenBucket::new(capacity, refill_rate, now),
                last_seen: now,
            });
        entry.last_seen = now;
        let decision = entry.bucket.consume(now);
        Self::prune(&mut buckets, now, self.max_entries, self.stale_after_seconds);
        decision
    }
}
