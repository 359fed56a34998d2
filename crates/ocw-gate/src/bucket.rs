// SPDX-License-Identifier: MIT OR Apache-2.0
//! Token buckets keyed by `(client ip, endpoint class)`.

use crate::GateError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Endpoint family a request belongs to for rate-limiting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Read-only admin/observability endpoints.
    Read,
    /// State-changing admin endpoints.
    Write,
    /// Webhook ingestion.
    Webhook,
    /// Assist (LLM) endpoints.
    Assist,
    /// Bridge subtree.
    Bridge,
}

/// Capacity and refill rate for one endpoint class.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    /// Maximum burst size.
    pub capacity: f64,
    /// Tokens refilled per second.
    pub refill_per_sec: f64,
}

impl BucketConfig {
    /// Default shape per endpoint class.
    #[must_use]
    pub fn for_class(class: EndpointClass) -> Self {
        match class {
            EndpointClass::Read => Self {
                capacity: 60.0,
                refill_per_sec: 30.0,
            },
            EndpointClass::Write => Self {
                capacity: 10.0,
                refill_per_sec: 2.0,
            },
            EndpointClass::Webhook => Self {
                capacity: 20.0,
                refill_per_sec: 5.0,
            },
            EndpointClass::Assist => Self {
                capacity: 6.0,
                refill_per_sec: 0.5,
            },
            EndpointClass::Bridge => Self {
                capacity: 20.0,
                refill_per_sec: 5.0,
            },
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-client token-bucket rate limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<(IpAddr, EndpointClass), Bucket>>,
    overrides: HashMap<EndpointClass, BucketConfig>,
}

impl RateLimiter {
    /// Limiter using the default per-class shapes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            overrides: HashMap::new(),
        }
    }

    /// Override the shape for one class.
    #[must_use]
    pub fn with_config(mut self, class: EndpointClass, config: BucketConfig) -> Self {
        self.overrides.insert(class, config);
        self
    }

    fn config_for(&self, class: EndpointClass) -> BucketConfig {
        self.overrides
            .get(&class)
            .copied()
            .unwrap_or_else(|| BucketConfig::for_class(class))
    }

    /// Take one token for `(ip, class)`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::RateLimitExceeded`] with the time until the next
    /// token when the bucket is empty.
    pub fn check(&self, ip: IpAddr, class: EndpointClass) -> Result<(), GateError> {
        let config = self.config_for(class);
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets.entry((ip, class)).or_insert_with(|| Bucket {
            tokens: config.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * config.refill_per_sec).min(config.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait = deficit / config.refill_per_sec.max(f64::EPSILON);
            Err(GateError::RateLimitExceeded {
                retry_after: Duration::from_secs_f64(wait.max(0.05)),
            })
        }
    }

    /// Drop buckets idle longer than `idle`.
    pub fn prune(&self, idle: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        buckets.retain(|_, b| now.duration_since(b.last_refill) < idle);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
