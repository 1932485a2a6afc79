use std::time::{Duration, Instant};

/// Three-state admission gate guarding one upstream.
///
/// Failure means: upstream HTTP status >= 500, transport error, or timeout.
/// Anything below 500 counts as success. Cancelled requests record neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    threshold: u32,
    retry_delay: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, retry_delay: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            threshold,
            retry_delay,
        }
    }

    /// Whether a request may go through right now. An OPEN breaker past its
    /// retry delay flips to HALF_OPEN and admits the trial call.
    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) >= self.retry_delay {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// True when the breaker would short-circuit a request arriving at `now`.
    /// Unlike `admit_at` this never transitions state, so load balancers can
    /// peek at it when deciding failover.
    pub fn is_open_at(&self, now: Instant) -> bool {
        match self.state {
            BreakerState::Open { opened_at } => {
                now.saturating_duration_since(opened_at) < self.retry_delay
            }
            _ => false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.state = BreakerState::Open { opened_at: now };
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open { opened_at: now };
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn state_label(&self) -> &'static str {
        match self.state {
            BreakerState::Closed => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(3))
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut cb = breaker();
        let now = Instant::now();
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert!(cb.admit_at(now));
        cb.record_failure_at(now);
        assert!(!cb.admit_at(now));
        assert_eq!(cb.state_label(), "open");
    }

    #[test]
    fn success_resets_the_counter() {
        let mut cb = breaker();
        let now = Instant::now();
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        cb.record_success();
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert!(cb.admit_at(now), "two failures after a success stay closed");
    }

    #[test]
    fn half_open_after_retry_delay_then_failure_reopens() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(t0);
        }
        assert!(!cb.admit_at(t0 + Duration::from_secs(1)));

        let t1 = t0 + Duration::from_secs(3);
        assert!(cb.admit_at(t1), "trial call admitted after retry delay");
        assert_eq!(cb.state_label(), "half_open");

        cb.record_failure_at(t1);
        assert_eq!(cb.state_label(), "open");
        assert!(!cb.admit_at(t1 + Duration::from_secs(1)));
    }

    #[test]
    fn half_open_success_closes() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(t0);
        }
        let t1 = t0 + Duration::from_secs(4);
        assert!(cb.admit_at(t1));
        cb.record_success();
        assert_eq!(cb.state_label(), "closed");
        assert!(cb.admit_at(t1));
    }

    #[test]
    fn peek_does_not_transition() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure_at(t0);
        }
        let t1 = t0 + Duration::from_secs(10);
        assert!(!cb.is_open_at(t1), "past delay the breaker no longer blocks");
        assert_eq!(cb.state_label(), "open", "peeking must not flip state");
    }
}
