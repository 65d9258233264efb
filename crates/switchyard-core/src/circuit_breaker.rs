//! Circuit breaker guarding dispatch into a domain.
//!
//! Closed → Open after `failure_threshold` consecutive failures. Once
//! `recovery_timeout` has elapsed the breaker admits exactly one trial call
//! (Half-Open); the trial's outcome closes or re-opens it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view used by health reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Denied,
    Normal,
    Trial,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, promoting Open → Half-Open when the timeout has passed.
    pub fn state(&self) -> CircuitState {
        let mut st = self.lock();
        self.promote(&mut st);
        st.state
    }

    fn promote(&self, st: &mut BreakerState) {
        if st.state == CircuitState::Open {
            let elapsed = st.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed >= self.config.recovery_timeout() {
                st.state = CircuitState::HalfOpen;
                st.trial_in_flight = false;
            }
        }
    }

    /// Whether a call may proceed. In Half-Open only the first caller gets
    /// through until that trial reports back.
    pub fn allow(&self) -> bool {
        self.admit() != Admission::Denied
    }

    fn admit(&self) -> Admission {
        let mut st = self.lock();
        self.promote(&mut st);
        match st.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => Admission::Denied,
            CircuitState::HalfOpen => {
                if st.trial_in_flight {
                    Admission::Denied
                } else {
                    st.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Free the Half-Open slot of a trial that will never report back.
    fn abandon_trial(&self) {
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen && st.trial_in_flight {
            st.trial_in_flight = false;
            tracing::debug!("[CircuitBreaker:{}] Trial abandoned", self.name);
        }
    }

    pub fn record_success(&self) {
        let mut st = self.lock();
        if st.state != CircuitState::Closed {
            tracing::info!("[CircuitBreaker:{}] Closed after successful trial", self.name);
        }
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.opened_at = None;
        st.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut st = self.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        match st.state {
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                st.opened_at = Some(Instant::now());
                st.trial_in_flight = false;
                tracing::warn!("[CircuitBreaker:{}] Trial failed, re-opened", self.name);
            }
            CircuitState::Closed if st.consecutive_failures >= self.config.failure_threshold => {
                st.state = CircuitState::Open;
                st.opened_at = Some(Instant::now());
                tracing::warn!(
                    "[CircuitBreaker:{}] Opened after {} consecutive failures",
                    self.name,
                    st.consecutive_failures
                );
            }
            _ => {}
        }
    }

    /// Run `op` through the breaker. An open circuit short-circuits with
    /// `OrchestratorError::CircuitOpen` without polling `op`.
    pub async fn call<T, E, Fut>(&self, op: Fut) -> Result<T, OrchestratorError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<OrchestratorError>,
    {
        let admission = self.admit();
        if admission == Admission::Denied {
            return Err(OrchestratorError::CircuitOpen(self.name.clone()));
        }
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };
        let outcome = op.await;
        guard.armed = false;
        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err.into())
            }
        }
    }

    pub fn reset(&self) {
        let mut st = self.lock();
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.opened_at = None;
        st.trial_in_flight = false;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut st = self.lock();
        self.promote(&mut st);
        let retry_in_secs = match (st.state, st.opened_at) {
            (CircuitState::Open, Some(at)) => Some(
                self.config
                    .recovery_timeout()
                    .saturating_sub(at.elapsed())
                    .as_secs_f64(),
            ),
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: st.state,
            failure_count: st.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout_secs,
            retry_in_secs,
        }
    }
}

/// Held across a trial call; dropping it before the outcome is recorded
/// (the caller's future was cancelled) releases the trial slot.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "nlp",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_secs: recovery_ms as f64 / 1000.0,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(5, 60_000);
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
        assert!(cb.snapshot().retry_in_secs.is_some());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 2);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let cb = breaker(1, 20);
        cb.record_failure();
        assert!(!cb.allow());
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow());
        assert!(!cb.allow());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = breaker(1, 20);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[tokio::test]
    async fn test_call_short_circuits_when_open() {
        let cb = breaker(1, 60_000);
        let first: Result<(), OrchestratorError> = cb
            .call(async { Err::<(), _>(OrchestratorError::Internal("boom".into())) })
            .await;
        assert!(first.is_err());

        let mut polled = false;
        let second = cb
            .call(async {
                polled = true;
                Ok::<_, OrchestratorError>(())
            })
            .await;
        assert!(matches!(second, Err(OrchestratorError::CircuitOpen(name)) if name == "nlp"));
        assert!(!polled);
    }

    #[tokio::test]
    async fn test_cancelled_trial_frees_half_open_slot() {
        let cb = breaker(1, 20);
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(std::future::pending::<Result<(), OrchestratorError>>()),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial = cb.call(async { Ok::<_, OrchestratorError>(7) }).await;
        assert_eq!(trial.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
