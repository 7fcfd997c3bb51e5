// Token-bucket rate limiting for agent requests
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::security::error::GateError;
use crate::security::middleware::RequestContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_limit: u32,
    /// Buckets untouched for this long are dropped by the sweep
    pub idle_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            burst_limit: 20,
            idle_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token buckets behind one coarse lock.
///
/// Refill and decrement for a key happen inside a single critical section,
/// so concurrent callers never lose updates. The lock is never held across
/// an await.
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    idle_timeout: Duration,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            rate_per_sec: f64::from(config.requests_per_minute) / 60.0,
            capacity: f64::from(config.burst_limit),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Admission decision for `key` as of `now`.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let bucket = match buckets.entry(key.to_string()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                slot.insert(TokenBucket {
                    tokens: self.capacity - 1.0,
                    last_refill: now,
                });
                return true;
            }
        };

        // Instant is monotonic, but callers may pass an older `now`; never refill backwards.
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop idle buckets. Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= self.idle_timeout);
        before - buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run the idle sweep on a fixed interval until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep_idle();
                if removed > 0 {
                    debug!("Rate limiter swept {} idle buckets", removed);
                }
            }
        })
    }
}

/// Bucket key for a request: a function of both the client address and the
/// presented credential, so rotating either one alone cannot reset the budget.
/// The credential is hashed so raw secrets never sit in the bucket map.
pub fn client_key(client_ip: &str, authorization: Option<&str>) -> String {
    let credential = hex::encode(Sha256::digest(authorization.unwrap_or_default().as_bytes()));
    format!("{}:{}", client_ip, &credential[..16])
}

/// Rate-limit stage: last before the handler.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    mut request: Request,
    next: Next,
) -> Result<Response, GateError> {
    let context = RequestContext::ensure(&mut request);
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let key = client_key(context.client_ip(), authorization);

    if !limiter.allow(&key) {
        warn!("⚠️  Rate limit exceeded for client {}", context.client_ip());
        return Err(GateError::RateLimited);
    }

    Ok(next.run(request).await)
}
