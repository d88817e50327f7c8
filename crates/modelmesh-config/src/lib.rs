//! Recognized configuration keys for the unification core and lifecycle
//! layer. Loading the bytes off disk (the YAML file convention used by the
//! surrounding registry) is the caller's problem; this crate only defines
//! the shape and the defaulting/clamping behavior. Invalid values are
//! always clamped to a sane default rather than rejected.

use std::time::Duration;

pub use modelmesh_breaker::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};

const ONE_HOUR_MS: i64 = 3_600_000;

/// Exponential backoff with jitter for the discovery retry helper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicyConfig {
    pub fn normalized(self) -> Self {
        let default = Self::default();
        Self {
            max_attempts: if self.max_attempts == 0 { default.max_attempts } else { self.max_attempts },
            initial_backoff_ms: if self.initial_backoff_ms <= 0 {
                default.initial_backoff_ms
            } else {
                self.initial_backoff_ms
            },
            max_backoff_ms: if self.max_backoff_ms <= 0 { default.max_backoff_ms } else { self.max_backoff_ms },
            backoff_multiplier: if self.backoff_multiplier <= 1.0 {
                default.backoff_multiplier
            } else {
                self.backoff_multiplier
            },
        }
    }

    /// Computes the backoff duration for a 1-indexed attempt, with up to
    /// ±10% jitter, capped at `max_backoff_ms`. `jitter_unit` must be in
    /// `[0.0, 1.0)`; callers that don't care about determinism can feed it
    /// any uniform random source.
    pub fn backoff_duration(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let attempt = attempt.max(1);
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max_backoff_ms as f64);
        let jitter_unit = jitter_unit.clamp(0.0, 1.0);
        let jitter = (jitter_unit * 2.0 - 1.0) * capped * 0.1;
        let with_jitter = (capped + jitter).max(0.0);
        Duration::from_millis(with_jitter.round() as u64)
    }
}

/// All configuration recognized by the catalog and lifecycle layer. See
/// the per-field docs for the key name and effect a caller's config file
/// would map to this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// `model_ttl`: age after which an unseen model is purged by the sweep.
    pub model_ttl_ms: i64,
    /// `cleanup_interval`: period of the TTL/orphan sweep.
    pub cleanup_interval_ms: i64,
    /// `enable_background_cleanup`: whether to spawn the sweep task.
    pub enable_background_cleanup: bool,
    /// `endpoint_health_check_interval`: hint for external health
    /// pollers; the core never reads this itself.
    pub endpoint_health_check_interval_ms: i64,
    /// `max_consecutive_failures`: threshold for degraded -> offline.
    pub max_consecutive_failures: u32,
    /// `enable_state_transition_logging`: whether to spawn the event
    /// drainer task that logs transitions.
    pub enable_state_transition_logging: bool,
    /// `discovery_retry_policy.*`
    pub discovery_retry_policy: RetryPolicyConfig,
    /// `circuit_breaker.*`
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_ttl_ms: 24 * ONE_HOUR_MS,
            cleanup_interval_ms: 5 * 60_000,
            enable_background_cleanup: true,
            endpoint_health_check_interval_ms: 30_000,
            max_consecutive_failures: 3,
            enable_state_transition_logging: true,
            discovery_retry_policy: RetryPolicyConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl Config {
    /// Clamps every field to a sane default instead of erroring, per the
    /// "invalid values are clamped, never rejected" configuration policy.
    pub fn normalized(self) -> Self {
        let default = Self::default();
        Self {
            model_ttl_ms: if self.model_ttl_ms <= 0 { default.model_ttl_ms } else { self.model_ttl_ms },
            cleanup_interval_ms: if self.cleanup_interval_ms <= 0 {
                default.cleanup_interval_ms
            } else {
                self.cleanup_interval_ms
            },
            enable_background_cleanup: self.enable_background_cleanup,
            endpoint_health_check_interval_ms: if self.endpoint_health_check_interval_ms <= 0 {
                default.endpoint_health_check_interval_ms
            } else {
                self.endpoint_health_check_interval_ms
            },
            max_consecutive_failures: if self.max_consecutive_failures == 0 {
                default.max_consecutive_failures
            } else {
                self.max_consecutive_failures
            },
            enable_state_transition_logging: self.enable_state_transition_logging,
            discovery_retry_policy: self.discovery_retry_policy.normalized(),
            circuit_breaker: self.circuit_breaker.normalized(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.model_ttl_ms, 86_400_000);
        assert_eq!(config.max_consecutive_failures, 3);
    }

    #[test]
    fn invalid_values_clamp_to_defaults() {
        let config = Config {
            model_ttl_ms: -1,
            cleanup_interval_ms: 0,
            max_consecutive_failures: 0,
            ..Config::default()
        }
        .normalized();

        assert_eq!(config.model_ttl_ms, Config::default().model_ttl_ms);
        assert_eq!(config.cleanup_interval_ms, Config::default().cleanup_interval_ms);
        assert_eq!(config.max_consecutive_failures, Config::default().max_consecutive_failures);
    }

    #[test]
    fn backoff_is_capped_and_jittered() {
        let policy = RetryPolicyConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.backoff_duration(1, 0.5).as_millis(), 100);
        // attempt 3 would be 400ms uncapped; capped at 300.
        let capped = policy.backoff_duration(3, 0.5).as_millis();
        assert_eq!(capped, 300);
        let low_jitter = policy.backoff_duration(3, 0.0).as_millis();
        let high_jitter = policy.backoff_duration(3, 1.0).as_millis();
        assert!(low_jitter <= capped && high_jitter >= capped);
    }
}
