//! Connection caps and authentication rate limiting.
//!
//! Two mechanisms per source address: a token bucket paced at a steady
//! refill for authentication attempts, and an exponential backoff window
//! that opens on repeated failures. Connection counts are capped globally
//! and per address.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Cap across all sources.
    pub max_connections: usize,
    pub max_per_ip: usize,
    /// Token bucket capacity for auth attempts.
    pub auth_burst: u32,
    /// Tokens regained per second.
    pub auth_refill_per_sec: f64,
    /// First backoff window after a failure streak begins.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            max_per_ip: 16,
            auth_burst: 6,
            auth_refill_per_sec: 0.5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("too many connections")]
    TooManyConnections,
    #[error("too many connections from {0}")]
    TooManyFromSource(IpAddr),
    #[error("rate limit exceeded")]
    RateLimited,
}

#[derive(Debug)]
struct SourceState {
    connections: usize,
    tokens: f64,
    refilled: Instant,
    failures: u32,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    total: usize,
    sources: HashMap<IpAddr, SourceState>,
}

/// Shared limiter, one per server.
pub struct Limiter {
    config: LimiterConfig,
    inner: Mutex<Inner>,
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Account for a new connection; call [`Limiter::disconnect`] when the
    /// session ends.
    pub fn connect(&self, ip: IpAddr, now: Instant) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.total >= self.config.max_connections {
            return Err(Error::TooManyConnections);
        }
        let burst = self.config.auth_burst;
        let state = inner
            .sources
            .entry(ip)
            .or_insert_with(|| SourceState::fresh(burst, now));
        if state.connections >= self.config.max_per_ip {
            return Err(Error::TooManyFromSource(ip));
        }
        state.connections += 1;
        inner.total += 1;
        Ok(())
    }

    pub fn disconnect(&self, ip: IpAddr) {
        let mut inner = self.lock();
        inner.total = inner.total.saturating_sub(1);
        if let Some(state) = inner.sources.get_mut(&ip) {
            state.connections = state.connections.saturating_sub(1);
            if state.is_idle(self.config.auth_burst) {
                inner.sources.remove(&ip);
            }
        }
    }

    /// Gate one authentication attempt from `ip`.
    pub fn check_auth(&self, ip: IpAddr, now: Instant) -> Result<(), Error> {
        let mut inner = self.lock();
        let burst = self.config.auth_burst;
        let state = inner
            .sources
            .entry(ip)
            .or_insert_with(|| SourceState::fresh(burst, now));

        if let Some(until) = state.blocked_until {
            if now < until {
                return Err(Error::RateLimited);
            }
            state.blocked_until = None;
        }

        state.refill(now, self.config.auth_refill_per_sec, burst);
        if state.tokens < 1.0 {
            return Err(Error::RateLimited);
        }
        state.tokens -= 1.0;
        Ok(())
    }

    /// A failed attempt extends the backoff window exponentially, with a
    /// little jitter to keep retry storms from synchronizing.
    pub fn auth_failed(&self, ip: IpAddr, now: Instant) {
        let mut inner = self.lock();
        let burst = self.config.auth_burst;
        let state = inner
            .sources
            .entry(ip)
            .or_insert_with(|| SourceState::fresh(burst, now));
        state.failures = state.failures.saturating_add(1);

        let exp = state.failures.saturating_sub(1).min(16);
        let base = self.config.backoff_base.as_secs_f64() * (1u64 << exp) as f64;
        let jittered = base * (1.0 + fastrand::f64() * 0.25);
        let window = Duration::from_secs_f64(jittered.min(self.config.backoff_max.as_secs_f64()));
        state.blocked_until = Some(now + window);
        log::debug!(
            target: "ssh",
            "Auth failure #{} from {ip}; backing off {:.1}s",
            state.failures,
            window.as_secs_f64()
        );
    }

    pub fn auth_succeeded(&self, ip: IpAddr) {
        let mut inner = self.lock();
        if let Some(state) = inner.sources.get_mut(&ip) {
            state.failures = 0;
            state.blocked_until = None;
        }
    }

    /// Drop bookkeeping for idle sources.
    pub fn prune(&self) {
        let mut inner = self.lock();
        let burst = self.config.auth_burst;
        inner.sources.retain(|_, state| !state.is_idle(burst));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("ssh: limiter lock poisoned")
    }
}

impl SourceState {
    fn fresh(burst: u32, now: Instant) -> Self {
        Self {
            connections: 0,
            tokens: f64::from(burst),
            refilled: now,
            failures: 0,
            blocked_until: None,
        }
    }

    fn refill(&mut self, now: Instant, per_sec: f64, burst: u32) {
        let elapsed = now.saturating_duration_since(self.refilled).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_sec).min(f64::from(burst));
        self.refilled = now;
    }

    fn is_idle(&self, burst: u32) -> bool {
        self.connections == 0 && self.failures == 0 && self.tokens >= f64::from(burst)
    }
}
