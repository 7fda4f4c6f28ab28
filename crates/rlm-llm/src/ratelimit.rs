//! In-memory token-bucket rate limiter for backend requests.
//!
//! Each model gets an independent bucket with a configurable burst and refill
//! rate. The bucket is shared by every session in a call tree, so nested
//! sessions and batch members draw from the same budget as the root.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use rlm_core::{Result, RlmError};

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum burst size (tokens in the bucket).
    pub burst: u32,
    /// Tokens refilled per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 60,
            refill_per_sec: 10.0,
        }
    }
}

/// A token bucket for a single model.
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    /// Refill tokens based on elapsed time, then try to consume one.
    fn try_consume(&mut self, burst: u32, refill_per_sec: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(burst as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available. `None` when no token can
    /// ever be taken: the bucket never refills, or holds less than one token.
    fn wait_time(&self, burst: u32, refill_per_sec: f64) -> Option<Duration> {
        if refill_per_sec <= 0.0 || burst < 1 {
            return None;
        }
        let needed = (1.0 - self.tokens).max(0.0);
        Some(Duration::from_secs_f64(needed / refill_per_sec))
    }
}

/// Shared rate limiter, keyed by model string.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Try to take a token for `model`. Returns Ok(()) if allowed, or the
    /// time until a token is available. `None` means one never will be.
    pub fn check(&self, model: &str) -> std::result::Result<(), Option<Duration>> {
        let mut entry = self
            .buckets
            .entry(model.to_string())
            .or_insert_with(|| Bucket::new(self.config.burst));
        if entry.try_consume(self.config.burst, self.config.refill_per_sec) {
            Ok(())
        } else {
            Err(entry.wait_time(self.config.burst, self.config.refill_per_sec))
        }
    }

    /// Wait until a token for `model` is available and take it.
    pub async fn acquire(&self, model: &str) -> Result<()> {
        loop {
            match self.check(model) {
                Ok(()) => return Ok(()),
                Err(Some(wait)) => {
                    debug!(model, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
                Err(None) => {
                    return Err(RlmError::RateLimited {
                        retry_after_secs: 60,
                    });
                }
            }
        }
    }
}
