use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::config::CircuitBreakerOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker in front of the policy engine.
///
/// After `failure_threshold` failures the breaker opens and refuses calls for
/// `open_timeout`. It then lets calls through half-open: the next success
/// closes it, the next failure opens it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn state(&self) -> CircuitState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.state_of(&state)
    }

    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = BreakerState::default();
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if self.state_of(&state) == CircuitState::HalfOpen {
            state.opened_at = Some(now);
            state.last_failure = Some(now);
            tracing::warn!("circuit breaker re-opened after failed trial call");
            return;
        }

        if let Some(last) = state.last_failure
            && now.duration_since(last) >= self.options.reset_timeout
        {
            state.consecutive_failures = 0;
        }
        state.consecutive_failures += 1;
        state.last_failure = Some(now);

        if state.opened_at.is_none() && state.consecutive_failures >= self.options.failure_threshold {
            state.opened_at = Some(now);
            tracing::warn!(
                failures = state.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    fn state_of(&self, state: &BreakerState) -> CircuitState {
        match state.opened_at {
            None => CircuitState::Closed,
            Some(opened) if opened.elapsed() >= self.options.open_timeout => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }
}
