//! Count-based circuit breaker for provider calls.
//!
//! Semantics:
//! - Sliding window of the last `window_size` call outcomes.
//! - Trips OPEN when ≥ `failure_rate_threshold` of the window failed, or
//!   ≥ `slow_call_rate_threshold` of the window exceeded
//!   `slow_call_duration` (slow calls count against health even when they
//!   succeed).
//! - OPEN rejects calls for `open_duration`, then transitions HALF-OPEN
//!   and permits `half_open_permits` probe calls. Any probe failure
//!   re-opens; all probes succeeding closes.
//!
//! Validation/wiring errors must not be recorded — they say nothing about
//! provider health (callers gate on `ProviderError::counts_as_failure`).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use agentforge_core::error::ProviderError;

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub window_size: usize,
    pub failure_rate_threshold: f64,
    pub slow_call_duration: Duration,
    pub slow_call_rate_threshold: f64,
    pub open_duration: Duration,
    pub half_open_permits: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_rate_threshold: 0.5,
            slow_call_duration: Duration::from_secs(60),
            slow_call_rate_threshold: 0.8,
            open_duration: Duration::from_secs(30),
            half_open_permits: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { issued: u32, succeeded: u32 },
}

#[derive(Debug)]
struct Inner {
    state: State,
    window: VecDeque<CallOutcome>,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: VecDeque::new(),
            }),
        }
    }

    /// Ask permission to place a call. `Err(CircuitOpen)` while OPEN or
    /// when HALF-OPEN probes are exhausted.
    pub fn try_acquire(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();

        enum Decision {
            Allow,
            BeginProbing,
            IssueProbe,
            Reject(&'static str),
        }

        let decision = match &inner.state {
            State::Closed => Decision::Allow,
            State::Open { since } => {
                if since.elapsed() >= self.settings.open_duration {
                    Decision::BeginProbing
                } else {
                    Decision::Reject("is open")
                }
            }
            State::HalfOpen { issued, .. } => {
                if *issued < self.settings.half_open_permits {
                    Decision::IssueProbe
                } else {
                    Decision::Reject("is probing, no permits left")
                }
            }
        };

        match decision {
            Decision::Allow => Ok(()),
            Decision::BeginProbing => {
                info!(breaker = %self.name, "circuit half-open, probing");
                inner.state = State::HalfOpen { issued: 1, succeeded: 0 };
                Ok(())
            }
            Decision::IssueProbe => {
                if let State::HalfOpen { issued, .. } = &mut inner.state {
                    *issued += 1;
                }
                Ok(())
            }
            Decision::Reject(why) => Err(ProviderError::CircuitOpen(format!(
                "breaker '{}' {why}",
                self.name
            ))),
        }
    }

    /// Record the outcome of a permitted call.
    pub fn record(&self, duration: Duration, failed: bool) {
        let slow = duration >= self.settings.slow_call_duration;
        let mut inner = self.inner.lock();

        enum Transition {
            Reopen,
            Probe { close: bool },
            RecordClosed,
            Ignore,
        }

        let transition = match &inner.state {
            State::HalfOpen { issued, succeeded } => {
                if failed || slow {
                    Transition::Reopen
                } else {
                    Transition::Probe {
                        close: succeeded + 1 >= self.settings.half_open_permits
                            && *issued >= self.settings.half_open_permits,
                    }
                }
            }
            State::Closed => Transition::RecordClosed,
            // A call that was in flight when the breaker opened; its
            // outcome no longer matters.
            State::Open { .. } => Transition::Ignore,
        };

        match transition {
            Transition::Reopen => {
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
                inner.state = State::Open { since: Instant::now() };
                inner.window.clear();
            }
            Transition::Probe { close } => {
                if let State::HalfOpen { succeeded, .. } = &mut inner.state {
                    *succeeded += 1;
                }
                if close {
                    info!(breaker = %self.name, "probes succeeded, circuit closed");
                    inner.state = State::Closed;
                    inner.window.clear();
                }
            }
            Transition::RecordClosed => {
                inner.window.push_back(CallOutcome { failed, slow });
                while inner.window.len() > self.settings.window_size {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.settings.window_size && self.should_trip(&inner.window) {
                    warn!(
                        breaker = %self.name,
                        open_secs = self.settings.open_duration.as_secs(),
                        "failure rate exceeded, circuit OPEN"
                    );
                    inner.state = State::Open { since: Instant::now() };
                    inner.window.clear();
                }
            }
            Transition::Ignore => {}
        }
    }

    fn should_trip(&self, window: &VecDeque<CallOutcome>) -> bool {
        let total = window.len() as f64;
        let failures = window.iter().filter(|o| o.failed).count() as f64;
        let slow = window.iter().filter(|o| o.slow).count() as f64;
        failures / total >= self.settings.failure_rate_threshold
            || slow / total >= self.settings.slow_call_rate_threshold
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, State::Open { .. })
    }
}
