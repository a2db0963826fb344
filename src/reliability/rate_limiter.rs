//! Token-bucket rate limiter keyed by endpoint.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

pub struct TokenBucketLimiter {
    enabled: bool,
    burst: f64,
    refill_per_sec: f64,
    max_keys: usize,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketLimiter {
    pub fn new(enabled: bool, burst: u32, refill_per_sec: f64, max_keys: usize) -> Self {
        Self {
            enabled,
            burst: f64::from(burst.max(1)),
            refill_per_sec: refill_per_sec.max(0.0),
            max_keys: max_keys.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.burst);
        bucket.refilled_at = now;
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn try_acquire(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        if !buckets.contains_key(key) && buckets.len() >= self.max_keys {
            // full buckets carry no state worth keeping
            let burst = self.burst;
            let refill = self.refill_per_sec;
            buckets.retain(|_, b| {
                let elapsed = now.duration_since(b.refilled_at).as_secs_f64();
                b.tokens + elapsed * refill < burst
            });

            if buckets.len() >= self.max_keys {
                let evict_key = buckets
                    .iter()
                    .min_by_key(|(_, b)| b.refilled_at)
                    .map(|(k, _)| k.clone());
                if let Some(evict_key) = evict_key {
                    buckets.remove(&evict_key);
                }
            }
        }

        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            tokens: self.burst,
            refilled_at: now,
        });
        self.refill(bucket, now);

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    pub fn remove(&self, key: &str) {
        self.buckets.lock().remove(key);
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}
