//! Per-endpoint fixed-window rate limiting against a shared counter store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::endpoint::RequestContext;
use crate::error::ApiError;

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),

    #[error("rate limit store lock poisoned")]
    Poisoned,
}

/// Limits returned by an endpoint's rate limiter for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u64,
    pub window: Duration,
    /// Counter key; empty means `<endpoint name>_<remote ip>`
    pub key: Option<String>,
}

impl RateLimit {
    pub fn new(max: u64, window: Duration) -> Self {
        Self { max, window, key: None }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Callback deciding the limit for a request; `None` skips limiting
pub type RateLimiter = Arc<dyn Fn(&RequestContext) -> Option<RateLimit> + Send + Sync>;

/// Shared counter store.
///
/// Implementations must increment and set the expiry of a new key as one
/// atomic step (Redis `MULTI`/`INCR`/`EXPIRE NX`, or a Lua script).
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increment `key` and return the new count; a key created by this call expires after `window`
    async fn incr_and_expire_if_new(&self, key: &str, window: Duration) -> Result<u64, RateLimitError>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    entries: HashMap<String, Counter>,
    last_sweep: Option<Instant>,
}

/// Process-local store; counters are not shared between instances.
///
/// Expired counters are swept at most once per sweep interval, so the map
/// holds the keys live in the current windows plus those that expired since
/// the last sweep.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    counters: Arc<Mutex<Counters>>,
    sweep_interval: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            counters: Arc::default(),
            sweep_interval: Self::SWEEP_INTERVAL,
        }
    }
}

impl MemoryStore {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.counters.lock().map(|c| c.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn incr_and_expire_if_new(&self, key: &str, window: Duration) -> Result<u64, RateLimitError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().map_err(|_| RateLimitError::Poisoned)?;

        let due = counters
            .last_sweep
            .map_or(true, |at| now.duration_since(at) >= self.sweep_interval);
        if due {
            let before = counters.entries.len();
            counters.entries.retain(|_, c| c.expires_at > now);
            counters.last_sweep = Some(now);
            let swept = before - counters.entries.len();
            if swept > 0 {
                tracing::debug!("Swept {} expired rate limit counter(s)", swept);
            }
        }

        let counter = counters
            .entries
            .entry(key.to_string())
            .and_modify(|c| {
                if c.expires_at <= now {
                    *c = Counter {
                        count: 0,
                        expires_at: now + window,
                    };
                }
            })
            .or_insert(Counter {
                count: 0,
                expires_at: now + window,
            });
        counter.count += 1;
        Ok(counter.count)
    }
}

/// Apply the endpoint's limiter, if it has one, to this request
pub async fn enforce(ctx: &RequestContext, limiter: &RateLimiter, store: &dyn RateLimitStore) -> Result<(), ApiError> {
    let Some(limit) = limiter(ctx) else {
        return Ok(());
    };

    let key = match limit.key.as_deref() {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => default_key(ctx.endpoint_name(), ctx.remote_ip()),
    };

    let count = store.incr_and_expire_if_new(&key, limit.window).await?;
    if count > limit.max {
        tracing::warn!("Rate limit exceeded for '{}' ({} > {})", key, count, limit.max);
        return Err(ApiError::too_many_requests("Too many requests, please try again later"));
    }
    Ok(())
}

pub fn default_key(endpoint_name: &str, remote_ip: &str) -> String {
    format!("{}_{}", endpoint_name, remote_ip)
}
