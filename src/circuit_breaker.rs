use crate::error::DeliveryError;
use std::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

/// Consecutive non-auth failures that open the breaker.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// How long an open breaker skips attempts.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub disabled_until: Option<Instant>,
}

/// Failure counter guarding one delivery path.
///
/// Closed: attempts proceed. Open: attempts are skipped until the cooldown
/// elapses, after which the next attempt simply goes through. There is no
/// separate half-open state.
///
/// The failure counter is reset to zero at the moment the breaker opens, so
/// after a cooldown it again takes `threshold` failures to reopen.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_settings(name, DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }

    pub fn with_settings(name: &'static str, threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            name,
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(CircuitBreakerState {
                consecutive_failures: 0,
                disabled_until: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the next attempt must be skipped. An elapsed cooldown is
    /// cleared here so the following attempt is let through.
    pub fn is_open(&self) -> bool {
        let mut state = self.lock();
        match state.disabled_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                state.disabled_until = None;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.disabled_until = None;
    }

    /// Count a failed attempt. Authentication failures are ignored.
    pub fn record_failure(&self, err: &DeliveryError) {
        if err.is_auth_failure() {
            return;
        }

        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.disabled_until = Some(Instant::now() + self.cooldown);
            state.consecutive_failures = 0;
            tracing::warn!(
                breaker = self.name,
                cooldown_secs = self.cooldown.as_secs(),
                "delivery failing repeatedly, circuit opened"
            );
        }
    }

    /// Feed the outcome of an attempt back into the breaker.
    pub fn record<T>(&self, outcome: &Result<T, DeliveryError>) {
        match outcome {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(err),
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        *self.lock()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
