//! A per-endpoint three-state circuit breaker (closed / open / half-open)
//! built entirely on atomics, in the spirit of the consecutive-failure
//! breaker used to guard sandboxed tool execution elsewhere in this
//! codebase's ancestry: no lock is ever held across the decision, and
//! `allow`/`record_success`/`record_failure` are safe to call from any
//! number of concurrent callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use dashmap::DashMap;
use modelmesh_types::{CircuitBreakerStats, CircuitState};
use serde::{Deserialize, Serialize};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Tunables for a circuit breaker. Invalid values (zero thresholds,
/// negative durations) are clamped to defaults rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_ms: i64,
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_ms: 30_000,
            half_open_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Clamps nonsensical values to the defaults instead of erroring.
    pub fn normalized(self) -> Self {
        let default = Self::default();
        Self {
            enabled: self.enabled,
            failure_threshold: if self.failure_threshold == 0 {
                default.failure_threshold
            } else {
                self.failure_threshold
            },
            success_threshold: if self.success_threshold == 0 {
                default.success_threshold
            } else {
                self.success_threshold
            },
            open_duration_ms: if self.open_duration_ms <= 0 {
                default.open_duration_ms
            } else {
                self.open_duration_ms
            },
            half_open_requests: if self.half_open_requests == 0 {
                default.half_open_requests
            } else {
                self.half_open_requests
            },
        }
    }
}

/// A single endpoint's circuit breaker state.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    half_open_inflight: AtomicU32,
    last_failure_time: AtomicI64,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            half_open_inflight: AtomicU32::new(0),
            last_failure_time: AtomicI64::new(0),
            config: config.normalized(),
        }
    }

    /// Returns whether a request to this endpoint should be allowed at
    /// time `now` (milliseconds on whatever epoch the caller uses
    /// consistently; tests may use a virtual clock). Disabled breakers
    /// always allow.
    pub fn allow(&self, now: i64) -> bool {
        if !self.config.enabled {
            return true;
        }

        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => true,
            STATE_OPEN => {
                let last_failure = self.last_failure_time.load(Ordering::SeqCst);
                if now - last_failure > self.config.open_duration_ms {
                    // Transition to half-open; only one caller wins the race.
                    if self
                        .state
                        .compare_exchange(STATE_OPEN, STATE_HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        self.successes.store(0, Ordering::SeqCst);
                        self.half_open_inflight.store(0, Ordering::SeqCst);
                    }
                    self.try_admit_half_open()
                } else {
                    false
                }
            }
            STATE_HALF_OPEN => self.try_admit_half_open(),
            _ => unreachable!("circuit breaker state is one of three values"),
        }
    }

    fn try_admit_half_open(&self) -> bool {
        let inflight = self.half_open_inflight.fetch_add(1, Ordering::SeqCst) + 1;
        if inflight <= self.config.half_open_requests {
            true
        } else {
            self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    /// Records a successful call against this endpoint.
    pub fn record_success(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => {
                self.failures.store(0, Ordering::SeqCst);
            }
            STATE_HALF_OPEN => {
                let successes = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    self.failures.store(0, Ordering::SeqCst);
                    self.successes.store(0, Ordering::SeqCst);
                    self.half_open_inflight.store(0, Ordering::SeqCst);
                }
            }
            _ => {}
        }
    }

    /// Records a failed call against this endpoint at time `now`.
    pub fn record_failure(&self, now: i64) {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::SeqCst);
                    self.successes.store(0, Ordering::SeqCst);
                    self.last_failure_time.store(now, Ordering::SeqCst);
                }
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_OPEN, Ordering::SeqCst);
                self.successes.store(0, Ordering::SeqCst);
                self.half_open_inflight.store(0, Ordering::SeqCst);
                self.last_failure_time.store(now, Ordering::SeqCst);
            }
            _ => {
                self.last_failure_time.store(now, Ordering::SeqCst);
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            failures: self.failures.load(Ordering::SeqCst),
            successes: self.successes.load(Ordering::SeqCst),
            half_open_requests: self.half_open_inflight.load(Ordering::SeqCst),
            last_failure_time: self.last_failure_time.load(Ordering::SeqCst),
        }
    }
}

/// Keeps one breaker per endpoint URL. Breakers are created lazily on
/// first use and kept alive until explicitly purged (e.g. on endpoint
/// removal or orphan sweep).
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config: config.normalized(),
        }
    }

    pub fn get_or_create(&self, url: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config)))
            .clone()
    }

    pub fn remove(&self, url: &str) {
        self.breakers.remove(url);
    }

    pub fn retain_urls(&self, active: &std::collections::HashSet<String>) {
        self.breakers.retain(|url, _| active.contains(url));
    }

    pub fn stats(&self) -> std::collections::HashMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 2,
            success_threshold: 1,
            open_duration_ms: 100,
            half_open_requests: 1,
        }
    }

    #[test]
    fn starts_closed_and_allows() {
        let breaker = CircuitBreaker::new(cfg());
        assert!(breaker.allow(0));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.record_failure(0);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(0);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow(10));
    }

    #[test]
    fn half_opens_after_duration_and_closes_on_success() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.record_failure(0);
        breaker.record_failure(0);
        assert!(!breaker.allow(50));
        assert!(breaker.allow(200));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.record_failure(0);
        breaker.record_failure(0);
        assert!(breaker.allow(200));
        breaker.record_failure(200);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_limits_inflight_requests() {
        let breaker = CircuitBreaker::new(cfg());
        breaker.record_failure(0);
        breaker.record_failure(0);
        assert!(breaker.allow(200));
        // Half-open requests capped at 1: a second concurrent probe is denied.
        assert!(!breaker.allow(200));
    }

    #[test]
    fn disabled_breaker_always_allows() {
        let mut config = cfg();
        config.enabled = false;
        let breaker = CircuitBreaker::new(config);
        breaker.record_failure(0);
        breaker.record_failure(0);
        assert!(breaker.allow(0));
    }

    #[test]
    fn registry_reuses_breaker_per_url() {
        let registry = CircuitBreakerRegistry::new(cfg());
        let a = registry.get_or_create("http://a");
        let b = registry.get_or_create("http://a");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn registry_retain_purges_orphans() {
        let registry = CircuitBreakerRegistry::new(cfg());
        registry.get_or_create("http://a");
        registry.get_or_create("http://b");
        let active: std::collections::HashSet<_> = ["http://a".to_string()].into_iter().collect();
        registry.retain_urls(&active);
        assert_eq!(registry.stats().len(), 1);
    }
}
