use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failed calls that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing one trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Circuit breaker for one backend endpoint.
///
/// Closed: calls pass, consecutive failures are counted.
/// Open: calls are rejected until the cooldown elapses.
/// Half-open: exactly one trial call passes; its outcome closes or re-opens.
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask to send a call. `Err` carries the remaining cooldown (zero while a trial is running).
    pub fn admit(self: &Arc<Self>) -> Result<BreakerTicket, Duration> {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed { .. } => Ok(BreakerTicket::new(self.clone(), false)),
            CircuitState::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.config.cooldown {
                    info!(endpoint = %self.endpoint, "circuit half-open, admitting trial call");
                    *state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(BreakerTicket::new(self.clone(), true))
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => Err(Duration::ZERO),
            CircuitState::HalfOpen {
                trial_in_flight: false,
            } => {
                *state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(BreakerTicket::new(self.clone(), true))
            }
        }
    }

    /// Remaining cooldown if [`admit`](Self::admit) would reject right now.
    /// Does not change state, so it never starts a half-open trial.
    pub fn rejecting(&self) -> Option<Duration> {
        match *self.state.lock() {
            CircuitState::Open { since } => self
                .config
                .cooldown
                .checked_sub(since.elapsed())
                .filter(|remaining| !remaining.is_zero()),
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => Some(Duration::ZERO),
            _ => None,
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, CircuitState::Closed { .. }) {
            info!(endpoint = %self.endpoint, "circuit closed after successful call");
        }
        *state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    /// Returns true when this failure opened the circuit.
    fn on_failure(&self, trial: bool) -> bool {
        let mut state = self.state.lock();
        let open = match *state {
            _ if trial => true,
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    true
                } else {
                    *state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                    false
                }
            }
            // Already open, or a trial owned by someone else is running.
            _ => false,
        };
        if open {
            warn!(
                endpoint = %self.endpoint,
                cooldown_secs = self.config.cooldown.as_secs(),
                trial,
                "circuit opened"
            );
            *state = CircuitState::Open {
                since: Instant::now(),
            };
        }
        open
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            let mut state = self.state.lock();
            if matches!(
                *state,
                CircuitState::HalfOpen {
                    trial_in_flight: true
                }
            ) {
                *state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }

    pub fn state_name(&self) -> &'static str {
        match *self.state.lock() {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Admission to call an endpoint. Resolve it with [`success`](Self::success) or
/// [`failure`](Self::failure); dropping it unresolved (cancellation) records nothing
/// and frees a half-open trial slot for the next caller.
pub struct BreakerTicket {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerTicket {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success();
    }

    /// Returns true when this failure opened the circuit.
    pub fn failure(mut self) -> bool {
        self.resolved = true;
        self.breaker.on_failure(self.trial)
    }
}

impl Drop for BreakerTicket {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandoned(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "mock://test",
            BreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_cooldown(Duration::from_millis(cooldown_ms)),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold() {
        let b = breaker(3, 1000);
        assert!(!b.admit().unwrap().failure());
        assert!(!b.admit().unwrap().failure());
        assert!(b.admit().unwrap().failure());
        assert_eq!(b.state_name(), "open");

        let remaining = b.admit().err().unwrap();
        assert!(remaining > Duration::ZERO && remaining <= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn rejecting_peeks_without_starting_a_trial() {
        let b = breaker(1, 100);
        assert_eq!(b.rejecting(), None);
        b.admit().unwrap().failure();
        assert!(b.rejecting().is_some());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(b.rejecting(), None);
        assert_eq!(b.state_name(), "open");

        let _trial = b.admit().unwrap();
        assert_eq!(b.rejecting(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_count() {
        let b = breaker(2, 1000);
        b.admit().unwrap().failure();
        b.admit().unwrap().success();
        assert!(!b.admit().unwrap().failure());
        assert_eq!(b.state_name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let b = breaker(1, 100);
        b.admit().unwrap().failure();
        tokio::time::advance(Duration::from_millis(150)).await;

        let trial = b.admit().unwrap();
        assert!(trial.is_trial());
        assert_eq!(b.state_name(), "half_open");
        assert_eq!(b.admit().err(), Some(Duration::ZERO));

        trial.success();
        assert_eq!(b.state_name(), "closed");
        assert!(!b.admit().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens() {
        let b = breaker(1, 100);
        b.admit().unwrap().failure();
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(b.admit().unwrap().failure());
        assert_eq!(b.state_name(), "open");
        assert!(b.admit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_frees_slot() {
        let b = breaker(1, 100);
        b.admit().unwrap().failure();
        tokio::time::advance(Duration::from_millis(150)).await;

        drop(b.admit().unwrap());
        assert_eq!(b.state_name(), "half_open");
        assert!(b.admit().unwrap().is_trial());
    }

    #[test]
    fn config_floor() {
        let config = BreakerConfig::default().with_failure_threshold(0);
        assert_eq!(config.failure_threshold, 1);
    }
}
