//! Reliability primitives: circuit breaker, retry wrapper, rate limiter.
//!
//! Each external dependency (the automation client, the memory store) gets
//! its own [`CircuitBreaker`]; [`with_retry`] wraps a call against one.
//! [`RateLimiter`] guards operation+identity pairs independently of the
//! breaker.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{OrchestrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    circuit: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

/// Guards one external dependency. State lives behind a single mutex:
/// "atomic read/write on a small record" from the design.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: parking_lot::Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: parking_lot::Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    /// Checks whether a call may proceed right now, transitioning
    /// OPEN -> HALF_OPEN if the recovery timeout has elapsed. Does not admit
    /// more than one probe per HALF_OPEN window; the caller is expected to
    /// call `record_success`/`record_failure` before the next `allow`.
    fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_time
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(false);
                if elapsed {
                    state.circuit = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "circuit breaker half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        if state.circuit != CircuitState::Closed {
            info!(breaker = %self.name, "circuit breaker closed after success");
        }
        state.circuit = CircuitState::Closed;
        state.failure_count = 0;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());
        if state.circuit == CircuitState::HalfOpen || state.failure_count >= self.config.failure_threshold {
            state.circuit = CircuitState::Open;
            warn!(breaker = %self.name, failures = state.failure_count, "circuit breaker open");
        }
    }
}

/// Runs `f` up to `attempts` times against `breaker`, waiting
/// `delay * 2^k` before retry `k+1`. Any failure is recorded against the
/// breaker; the last failure is what gets returned once attempts are
/// exhausted. A call that would be rejected by an OPEN breaker returns
/// [`OrchestrationError::CircuitOpen`] immediately, without retrying.
pub async fn with_retry<F, Fut, T>(
    breaker: &CircuitBreaker,
    attempts: u32,
    delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !breaker.allow() {
        return Err(OrchestrationError::CircuitOpen(breaker.name.clone()));
    }

    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(delay * 2u32.pow(attempt - 1)).await;
        }
        match f().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) => {
                breaker.record_failure();
                last_err = Some(err);
                if !breaker.allow() {
                    break;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| OrchestrationError::Dependency("retry exhausted".to_string())))
}

/// Sliding-window rate limiter keyed by `(operation, identity)`. A single
/// lock guards the map; windows are aged lazily on read.
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    state: parking_lot::Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            state: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Records a new attempt and rejects if it would exceed the cap. The
    /// set of admitted calls is a prefix of the attempted calls when
    /// attempts are made serially.
    pub fn check(&self, operation: &str, identity: &str) -> Result<()> {
        let key = (operation.to_string(), identity.to_string());
        let now = Instant::now();
        let mut state = self.state.lock();
        let entry = state.entry(key).or_default();
        while let Some(&front) = entry.front() {
            if now.duration_since(front) >= self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() as u32 >= self.max_requests {
            return Err(OrchestrationError::Validation(format!(
                "rate limit exceeded for {operation}/{identity}"
            )));
        }
        entry.push_back(now);
        Ok(())
    }

    /// Count of (operation, identity) windows currently at capacity,
    /// consumed by the monitor's security loop.
    pub fn saturated_windows(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .values()
            .filter(|entry| {
                let live = entry.iter().filter(|t| now.duration_since(**t) < self.window).count();
                live as u32 >= self.max_requests
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(
            "dep",
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_millis(50),
            },
        );
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            let result: Result<()> = with_retry(&breaker, 1, Duration::from_millis(1), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(OrchestrationError::Dependency("boom".to_string()))
                }
            })
            .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected: Result<()> = with_retry(&breaker, 1, Duration::from_millis(1), || async {
            Ok(())
        })
        .await;
        assert!(matches!(rejected, Err(OrchestrationError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn half_open_probe_admitted_after_recovery_timeout() {
        let breaker = CircuitBreaker::new(
            "dep",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(20),
            },
        );
        let _: Result<()> = with_retry(&breaker, 1, Duration::from_millis(1), || async {
            Err(OrchestrationError::Dependency("boom".to_string()))
        })
        .await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result: Result<i32> =
            with_retry(&breaker, 1, Duration::from_millis(1), || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn rate_limiter_rejects_after_cap() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.check("op", "caller").is_ok());
        assert!(limiter.check("op", "caller").is_ok());
        assert!(limiter.check("op", "caller").is_err());
        assert!(limiter.check("op", "other-caller").is_ok());
    }
}
