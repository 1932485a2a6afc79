use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RateKey;
use crate::error::{GatewayError, GatewayResult};

use super::{Middleware, RequestCtx};

/// Token-bucket counter. Refill happens lazily on each acquire from a
/// monotonic clock; tokens never exceed capacity.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    rate: f64,
}

impl TokenBucket {
    pub fn new(capacity: u32, rate: f64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
            capacity: capacity as f64,
            rate,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiting stage. One bucket per key; buckets are created lazily and
/// kept for the process lifetime. The whole check is non-blocking: the map
/// lock is held only for the O(1) refill arithmetic.
pub struct RateLimit {
    capacity: u32,
    rate: f64,
    key: RateKey,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimit {
    pub fn new(capacity: u32, rate: f64, key: RateKey) -> Self {
        Self {
            capacity,
            rate,
            key,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn bucket_key(&self, ctx: &RequestCtx) -> String {
        match self.key {
            RateKey::PerService => "service".to_string(),
            RateKey::PerClientKey => ctx
                .principal
                .clone()
                .or_else(|| ctx.client_ip.map(|ip| ip.to_string()))
                .unwrap_or_else(|| "anonymous".to_string()),
            RateKey::PerIp => ctx
                .client_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

#[async_trait]
impl Middleware for RateLimit {
    async fn on_request(&self, ctx: &mut RequestCtx) -> GatewayResult<()> {
        let key = self.bucket_key(ctx);
        let admitted = {
            let mut buckets = self.buckets.lock().expect("rate-limit map poisoned");
            buckets
                .entry(key.clone())
                .or_insert_with(|| TokenBucket::new(self.capacity, self.rate))
                .try_acquire()
        };
        if admitted {
            Ok(())
        } else {
            warn!(%key, "rate limit exceeded");
            Err(GatewayError::RateLimited)
        }
    }
}
