//! Circuit breaker guarding a `MarketDataSource` (spec §4.5, generalized from
//! the teacher's consecutive-failure kill-switch).

use crate::models::{AdapterState, CircuitState};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    exchange: String,
    max_failures: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(exchange: impl Into<String>, max_failures: u32, cooldown_sec: u64) -> Self {
        Self {
            exchange: exchange.into(),
            max_failures,
            cooldown: Duration::from_secs(cooldown_sec),
            inner: Mutex::new(Inner {
                state: CircuitState::Idle,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Returns `Err(())` (caller maps to `AdapterError::CircuitOpen`) if the
    /// breaker refuses the call pre-emptively; transitions `open -> half_open`
    /// once the cooldown has elapsed.
    pub fn check(&self) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(())
                }
            }
            _ => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.max_failures {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                } else {
                    inner.state = CircuitState::Closed;
                }
            }
        }
    }

    pub fn snapshot(&self) -> AdapterState {
        let inner = self.inner.lock();
        let cooldown_remaining_s = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                (self.cooldown.saturating_sub(opened_at.elapsed())).as_secs_f64()
            }
            _ => 0.0,
        };
        AdapterState {
            exchange: self.exchange.clone(),
            state: inner.state,
            fail_count: inner.consecutive_failures,
            cooldown_remaining_s,
            threshold: self.max_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("binance", 3, 10);
        for _ in 0..2 {
            breaker.check().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
        breaker.check().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn one_success_resets_after_half_open() {
        let breaker = CircuitBreaker::new("binance", 1, 0);
        breaker.check().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        // Cooldown of 0s elapses immediately.
        breaker.check().unwrap();
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn one_failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new("binance", 1, 0);
        breaker.check().unwrap();
        breaker.record_failure();
        breaker.check().unwrap();
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
    }
}
