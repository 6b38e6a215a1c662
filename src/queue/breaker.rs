//! Circuit breakers for external analysis dependencies
//!
//! One breaker per analysis type. After `failure_threshold` consecutive
//! failures inside `window` the breaker opens and calls fail fast for
//! `cooldown`; the first call after that is a single half-open probe. A
//! probe whose outcome is never recorded expires after another `cooldown`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::AnalysisType;

/// Breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Failures older than this do not count
    pub window_secs: u64,

    /// How long an open circuit fails fast
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    HalfOpen { probe_started: Instant },
}

/// Breaker guarding one dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            threshold: config.failure_threshold.max(1),
            window: config.window(),
            cooldown: config.cooldown(),
            state: Mutex::new(State::Closed {
                failures: VecDeque::new(),
            }),
        }
    }

    /// May a call go through now? `Err` carries when to try again.
    pub fn check(&self, now: Instant) -> Result<(), Instant> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { until } if now < *until => Err(*until),
            State::Open { .. } => {
                info!(dependency = %self.name, "Circuit half-open, sending probe");
                *state = State::HalfOpen { probe_started: now };
                Ok(())
            }
            State::HalfOpen { probe_started } if now < *probe_started + self.cooldown => {
                Err(*probe_started + self.cooldown)
            }
            // The probe never reported back; let another call through
            State::HalfOpen { probe_started } => {
                warn!(dependency = %self.name, "Probe outcome never recorded, sending a new probe");
                *probe_started = now;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, State::Closed { .. }) {
            info!(dependency = %self.name, "Circuit closed");
        }
        *state = State::Closed {
            failures: VecDeque::new(),
        };
    }

    pub fn record_failure(&self, now: Instant) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { failures } => {
                while failures
                    .front()
                    .map_or(false, |t| now.saturating_duration_since(*t) > self.window)
                {
                    failures.pop_front();
                }
                failures.push_back(now);
                if failures.len() as u32 >= self.threshold {
                    warn!(
                        dependency = %self.name,
                        failures = failures.len(),
                        cooldown_secs = self.cooldown.as_secs(),
                        "Circuit opened"
                    );
                    *state = State::Open {
                        until: now + self.cooldown,
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!(dependency = %self.name, "Probe failed, circuit re-opened");
                *state = State::Open {
                    until: now + self.cooldown,
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn status(&self) -> BreakerStatus {
        match *self.state.lock() {
            State::Closed { .. } => BreakerStatus::Closed,
            State::Open { .. } => BreakerStatus::Open,
            State::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }

    /// Force the circuit open until `until`
    pub fn trip(&self, until: Instant) {
        *self.state.lock() = State::Open { until };
    }
}

/// Independent breakers, one per analysis type
#[derive(Debug, Clone)]
pub struct BreakerSet {
    breakers: Arc<HashMap<AnalysisType, Arc<CircuitBreaker>>>,
}

impl BreakerSet {
    pub fn new(config: &BreakerConfig) -> Self {
        let breakers = AnalysisType::all()
            .iter()
            .map(|t| (*t, Arc::new(CircuitBreaker::new(t.name(), config))))
            .collect();
        Self {
            breakers: Arc::new(breakers),
        }
    }

    pub fn get(&self, analysis: AnalysisType) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(&analysis)
    }

    pub fn statuses(&self) -> Vec<(AnalysisType, BreakerStatus)> {
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .map(|(t, b)| (*t, b.status()))
            .collect();
        out.sort_by_key(|(t, _)| *t);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &BreakerConfig {
                failure_threshold: 3,
                window_secs: 10,
                cooldown_secs: 5,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..2 {
            b.record_failure(now);
        }
        assert!(b.check(now).is_ok());
        b.record_failure(now);
        assert_eq!(b.status(), BreakerStatus::Open);
        assert_eq!(b.check(now), Err(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let b = breaker();
        let start = Instant::now();
        b.record_failure(start);
        b.record_failure(start);
        b.record_failure(start + Duration::from_secs(11));
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn test_success_resets_count() {
        let b = breaker();
        let now = Instant::now();
        b.record_failure(now);
        b.record_failure(now);
        b.record_success();
        b.record_failure(now);
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn test_half_open_single_probe() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_failure(now);
        }
        let after = now + Duration::from_secs(6);
        assert!(b.check(after).is_ok());
        assert_eq!(b.status(), BreakerStatus::HalfOpen);
        assert!(b.check(after).is_err());

        b.record_failure(after);
        assert_eq!(b.status(), BreakerStatus::Open);

        let later = after + Duration::from_secs(6);
        assert!(b.check(later).is_ok());
        b.record_success();
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn test_abandoned_probe_expires() {
        let b = breaker();
        let now = Instant::now();
        b.trip(now);

        // Probe admitted, then its caller goes away without reporting
        assert!(b.check(now).is_ok());
        let blocked = b.check(now + Duration::from_secs(1));
        assert_eq!(blocked, Err(now + Duration::from_secs(5)));

        let later = now + Duration::from_secs(5);
        assert!(b.check(later).is_ok());
        assert_eq!(b.status(), BreakerStatus::HalfOpen);
        assert!(b.check(later).is_err());
        b.record_success();
        assert_eq!(b.status(), BreakerStatus::Closed);
    }

    #[test]
    fn test_breakers_are_independent() {
        let set = BreakerSet::new(&BreakerConfig::default());
        let now = Instant::now();
        set.get(AnalysisType::AgeStereotype)
            .unwrap()
            .trip(now + Duration::from_secs(30));
        assert!(set.get(AnalysisType::AgeStereotype).unwrap().check(now).is_err());
        assert!(set.get(AnalysisType::GenderStereotype).unwrap().check(now).is_ok());
    }
}
