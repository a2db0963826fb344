//! Per-endpoint admission policies consulted before every mailbox write.
//!
//! Evaluation order is circuit breaker, then backpressure, then rate limit. A
//! rejection only affects the one target; the publish carries on with the
//! remaining delivery classes.

pub mod backpressure;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use backpressure::Backpressure;
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use rate_limiter::TokenBucketLimiter;

use crate::config::ReliabilityConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Backpressure,
    CircuitOpen,
    RateLimited,
    EndpointNotFound,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backpressure => "backpressure",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::EndpointNotFound => "endpoint_not_found",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit admission for one mailbox write. Dropping it uncommitted hands a
/// half-open trial back to the breaker.
#[must_use]
pub struct Permit<'a> {
    policies: &'a ReliabilityPolicies,
    hash: &'a str,
    admission: Admission,
    committed: bool,
}

impl Permit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// The write was attempted; a trial now waits for its outcome.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.committed || self.admission != Admission::Trial {
            return;
        }
        if let Some(circuit) = &self.policies.circuit {
            circuit.abandon_trial(self.hash);
        }
    }
}

/// A target that declined a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub endpoint_hash: String,
    pub reason: RejectReason,
}

pub struct ReliabilityPolicies {
    circuit: Option<CircuitBreaker>,
    backpressure: Backpressure,
    rate_limiter: TokenBucketLimiter,
}

impl ReliabilityPolicies {
    pub fn from_config(config: &ReliabilityConfig) -> Self {
        let breaker = &config.circuit_breaker;
        let rate = &config.rate_limit;
        Self {
            circuit: breaker.enabled.then(|| {
                CircuitBreaker::new(
                    breaker.failure_threshold,
                    Duration::from_secs(breaker.failure_window_secs),
                    Duration::from_secs(breaker.cooldown_secs),
                )
            }),
            backpressure: Backpressure::new(
                config.backpressure.enabled,
                config.backpressure.max_pending,
            ),
            rate_limiter: TokenBucketLimiter::new(
                rate.enabled,
                rate.burst,
                rate.refill_per_sec,
                rate.max_tracked_endpoints,
            ),
        }
    }

    /// First stage: the circuit breaker. Runs before the mailbox is touched.
    pub fn admit<'a>(&'a self, hash: &'a str) -> Result<Permit<'a>, RejectReason> {
        let admission = match &self.circuit {
            None => Admission::Closed,
            Some(circuit) => circuit.try_acquire(hash).map_err(|remaining| {
                tracing::debug!(
                    endpoint_hash = hash,
                    retry_after_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                    "Circuit open; write refused"
                );
                RejectReason::CircuitOpen
            })?,
        };
        Ok(Permit {
            policies: self,
            hash,
            admission,
            committed: false,
        })
    }

    /// Second stage: backpressure against `pending`, then the rate limiter.
    /// Called with the mailbox locked so `pending` cannot go stale.
    pub fn check_capacity(&self, hash: &str, pending: usize) -> Result<(), RejectReason> {
        if !self.backpressure.admits(pending) {
            Err(RejectReason::Backpressure)
        } else if !self.rate_limiter.try_acquire(hash) {
            Err(RejectReason::RateLimited)
        } else {
            Ok(())
        }
    }

    /// Whether the capacity stage needs the pending depth at all.
    pub fn needs_pressure(&self) -> bool {
        self.backpressure.enabled()
    }

    /// A consumer took a message from the endpoint.
    pub fn record_success(&self, hash: &str) {
        if let Some(circuit) = &self.circuit {
            circuit.record_success(hash);
        }
    }

    pub fn record_failure(&self, hash: &str, error: &str) {
        if let Some(circuit) = &self.circuit {
            circuit.record_failure(hash, error);
        }
    }

    /// A consumer failed a message it had already claimed.
    pub fn record_claimed_failure(&self, hash: &str, error: &str) {
        if let Some(circuit) = &self.circuit {
            circuit.record_failure_after_success(hash, error);
        }
    }

    pub fn circuit_state(&self, hash: &str) -> CircuitState {
        self.circuit
            .as_ref()
            .map_or(CircuitState::Closed, |circuit| circuit.state(hash))
    }

    pub fn tripped_circuits(&self) -> Vec<(String, CircuitState)> {
        self.circuit
            .as_ref()
            .map(CircuitBreaker::tripped)
            .unwrap_or_default()
    }

    /// Drop all per-endpoint state (unregistration).
    pub fn forget(&self, hash: &str) {
        if let Some(circuit) = &self.circuit {
            circuit.remove(hash);
        }
        self.rate_limiter.remove(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackpressureConfig, CircuitBreakerConfig, RateLimitConfig};

    fn policies(max_pending: usize, burst: u32, threshold: u32) -> ReliabilityPolicies {
        ReliabilityPolicies::from_config(&ReliabilityConfig {
            backpressure: BackpressureConfig {
                enabled: true,
                max_pending,
            },
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: threshold,
                failure_window_secs: 60,
                cooldown_secs: 60,
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                burst,
                refill_per_sec: 0.001,
                max_tracked_endpoints: 100,
            },
        })
    }

    fn admit(p: &ReliabilityPolicies, hash: &str, pending: usize) -> Result<(), RejectReason> {
        let permit = p.admit(hash)?;
        p.check_capacity(hash, pending)?;
        permit.commit();
        Ok(())
    }

    fn tripped_after_cooldown(cooldown_secs: u64) -> ReliabilityPolicies {
        let mut config = ReliabilityConfig::default();
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.cooldown_secs = cooldown_secs;
        let p = ReliabilityPolicies::from_config(&config);
        p.record_failure("ep", "consumer error");
        p
    }

    #[test]
    fn backpressure_rejects_at_depth() {
        let p = policies(2, 100, 5);
        assert_eq!(admit(&p, "ep", 1), Ok(()));
        assert_eq!(admit(&p, "ep", 2), Err(RejectReason::Backpressure));
    }

    #[test]
    fn rate_limit_rejects_after_burst() {
        let p = policies(100, 2, 5);
        assert_eq!(admit(&p, "ep", 0), Ok(()));
        assert_eq!(admit(&p, "ep", 0), Ok(()));
        assert_eq!(admit(&p, "ep", 0), Err(RejectReason::RateLimited));
        assert_eq!(admit(&p, "other", 0), Ok(()));
    }

    #[test]
    fn circuit_is_checked_first() {
        let p = policies(1, 100, 1);
        p.record_failure("ep", "disk full");
        // would also fail backpressure, but the circuit answers first
        assert_eq!(admit(&p, "ep", 10), Err(RejectReason::CircuitOpen));
        assert_eq!(p.circuit_state("ep"), CircuitState::Open);
        assert_eq!(
            p.tripped_circuits(),
            vec![("ep".to_string(), CircuitState::Open)]
        );
    }

    #[test]
    fn disabled_circuit_always_admits() {
        let mut config = ReliabilityConfig::default();
        config.circuit_breaker.enabled = false;
        let p = ReliabilityPolicies::from_config(&config);
        for _ in 0..10 {
            p.record_failure("ep", "io");
        }
        assert_eq!(p.admit("ep").unwrap().admission(), Admission::Closed);
        assert_eq!(p.circuit_state("ep"), CircuitState::Closed);
    }

    #[test]
    fn dropped_trial_permit_is_handed_back() {
        let p = tripped_after_cooldown(0);
        let permit = p.admit("ep").unwrap();
        assert_eq!(permit.admission(), Admission::Trial);
        assert_eq!(p.admit("ep").err(), Some(RejectReason::CircuitOpen));

        drop(permit);
        assert_eq!(p.admit("ep").unwrap().admission(), Admission::Trial);
    }

    #[test]
    fn committed_trial_waits_for_consumer_outcome() {
        let p = tripped_after_cooldown(0);
        p.admit("ep").unwrap().commit();
        assert_eq!(p.admit("ep").err(), Some(RejectReason::CircuitOpen));

        p.record_success("ep");
        assert_eq!(p.circuit_state("ep"), CircuitState::Closed);
        assert_eq!(p.admit("ep").unwrap().admission(), Admission::Closed);
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(RejectReason::CircuitOpen.to_string(), "circuit_open");
        assert_eq!(
            serde_json::to_value(RejectReason::RateLimited).unwrap(),
            "rate_limited"
        );
        assert_eq!(RejectReason::EndpointNotFound.as_str(), "endpoint_not_found");
    }
}
