//! Per-peer circuit breaker counted in sync intervals.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    /// Intervals to skip before a half-open trial.
    pub cooldown: u32,
    skipped: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
            skipped: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.skipped = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.state == CircuitState::HalfOpen || self.failures >= self.threshold {
            self.state = CircuitState::Open;
            self.skipped = 0;
        }
    }

    /// Called once per interval. While open, counts down the cooldown and
    /// moves to half-open when it expires.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.skipped >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    self.skipped += 1;
                    false
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}
