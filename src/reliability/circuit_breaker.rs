//! Per-endpoint circuit breaker: `closed → open → half-open → closed`.
//!
//! The circuit opens after `failure_threshold` consecutive failures that fall
//! inside one `failure_window`. An open circuit refuses everything until the
//! cooldown passes, then admits exactly one trial. The trial's outcome closes
//! the circuit or opens it for another cooldown.
//!
//! Outcomes come from the consumer side: a claim is a success, a
//! consumer-reported failure is a failure. A failure reported for a message
//! that was already claimed takes back the success its claim recorded, so a
//! consumer that claims and then fails every message still trips the circuit.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Circuit {
    Closed {
        failures: u32,
        window_start: Instant,
        /// Streak cleared by the most recent success.
        forgiven: u32,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        trial_in_flight: bool,
    },
}

/// What an accepted `try_acquire` granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Closed,
    /// The single half-open trial. Resolved by the next recorded outcome or
    /// handed back with `abandon_trial`.
    Trial,
}

pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, Circuit>>,
    failure_threshold: u32,
    failure_window: Duration,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, failure_window: Duration, cooldown: Duration) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            failure_window,
            cooldown,
        }
    }

    /// Ask to attempt a delivery. `Err` carries the remaining cooldown (zero
    /// when a half-open trial is already in flight).
    pub fn try_acquire(&self, key: &str) -> Result<Admission, Duration> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(key) else {
            return Ok(Admission::Closed);
        };

        match *circuit {
            Circuit::Closed { .. } => Ok(Admission::Closed),
            Circuit::Open { until } if now >= until => {
                *circuit = Circuit::HalfOpen {
                    trial_in_flight: true,
                };
                tracing::info!(endpoint = key, "Circuit half-open; admitting trial delivery");
                Ok(Admission::Trial)
            }
            Circuit::Open { until } => Err(until - now),
            Circuit::HalfOpen {
                trial_in_flight: true,
            } => Err(Duration::ZERO),
            Circuit::HalfOpen {
                trial_in_flight: false,
            } => {
                *circuit = Circuit::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(Admission::Trial)
            }
        }
    }

    /// Release a trial that was admitted but never attempted.
    pub fn abandon_trial(&self, key: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit @ Circuit::HalfOpen { .. }) = circuits.get_mut(key) {
            *circuit = Circuit::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    pub fn record_success(&self, key: &str) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(key) else {
            return;
        };

        match *circuit {
            Circuit::Closed {
                failures,
                window_start,
                ..
            } => {
                if failures > 0 {
                    tracing::debug!(endpoint = key, previous_failures = failures, "Failure streak reset");
                }
                *circuit = Circuit::Closed {
                    failures: 0,
                    window_start,
                    forgiven: failures,
                };
            }
            Circuit::Open { until } if now < until => {}
            Circuit::Open { .. } | Circuit::HalfOpen { .. } => {
                tracing::info!(endpoint = key, "Trial delivery succeeded; circuit closed");
                // one retracted success re-opens
                *circuit = Circuit::Closed {
                    failures: 0,
                    window_start: now,
                    forgiven: self.failure_threshold - 1,
                };
            }
        }
    }

    pub fn record_failure(&self, key: &str, error: &str) {
        self.fail(key, error, false);
    }

    /// A failure for a message whose claim was already counted as a success.
    pub fn record_failure_after_success(&self, key: &str, error: &str) {
        self.fail(key, error, true);
    }

    fn fail(&self, key: &str, error: &str, retract_success: bool) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(key.to_string()).or_insert(Circuit::Closed {
            failures: 0,
            window_start: now,
            forgiven: 0,
        });

        match *circuit {
            Circuit::Closed {
                failures,
                window_start,
                forgiven,
            } => {
                let streak = if retract_success && failures == 0 {
                    forgiven
                } else {
                    failures
                };
                let (failures, window_start) =
                    if streak == 0 || now.duration_since(window_start) > self.failure_window {
                        (1, now)
                    } else {
                        (streak + 1, window_start)
                    };

                if failures >= self.failure_threshold {
                    tracing::warn!(
                        endpoint = key,
                        failure_count = failures,
                        threshold = self.failure_threshold,
                        cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX),
                        error,
                        "Endpoint failure threshold exceeded - opening circuit breaker"
                    );
                    *circuit = Circuit::Open {
                        until: now + self.cooldown,
                    };
                } else {
                    *circuit = Circuit::Closed {
                        failures,
                        window_start,
                        forgiven: 0,
                    };
                }
            }
            Circuit::HalfOpen { .. } => {
                tracing::warn!(endpoint = key, error, "Trial delivery failed; circuit re-opened");
                *circuit = Circuit::Open {
                    until: now + self.cooldown,
                };
            }
            Circuit::Open { .. } => {}
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        match self.circuits.lock().get(key) {
            None | Some(Circuit::Closed { .. }) => CircuitState::Closed,
            Some(Circuit::Open { until }) if Instant::now() >= *until => CircuitState::HalfOpen,
            Some(Circuit::Open { .. }) => CircuitState::Open,
            Some(Circuit::HalfOpen { .. }) => CircuitState::HalfOpen,
        }
    }

    /// Forget an endpoint (unregistration).
    pub fn remove(&self, key: &str) {
        self.circuits.lock().remove(key);
    }

    /// Endpoints whose circuit is not closed.
    pub fn tripped(&self) -> Vec<(String, CircuitState)> {
        let keys: Vec<String> = self.circuits.lock().keys().cloned().collect();
        let mut tripped: Vec<(String, CircuitState)> = keys
            .into_iter()
            .map(|key| {
                let state = self.state(&key);
                (key, state)
            })
            .filter(|(_, state)| *state != CircuitState::Closed)
            .collect();
        tripped.sort_by(|a, b| a.0.cmp(&b.0));
        tripped
    }
}
