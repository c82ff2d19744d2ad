//! Circuit breaker (C9, §4.9): a per-target sliding window of health-probe
//! outcomes driving a CLOSED → OPEN → HALF_OPEN → CLOSED state machine,
//! broadcast to subscribers via a tagged event (§9 redesign note).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::collab::ControlEvent;
use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct Window {
    started_at: Instant,
    requests: u32,
    errors: u32,
}

impl Window {
    fn fresh(now: Instant) -> Self {
        Window { started_at: now, requests: 0, errors: 0 }
    }
}

struct Inner {
    state: CircuitState,
    window: Window,
    /// Set when `state` became `Open`; used to time the `open-duration-ms`
    /// transition to `HalfOpen`.
    opened_at: Instant,
    half_open_successes: u32,
    /// Manual override (`force_open`/`force_close`) takes precedence until
    /// explicitly reset, per §4.9.
    forced: Option<CircuitState>,
}

/// One target's circuit breaker. Cheap to poll (a `Mutex` guarding plain
/// counters) since health probes run at most every few seconds, not on the
/// packet path.
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ControlEvent>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        let (events, _rx) = broadcast::channel(64);
        CircuitBreaker {
            target: target.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: Window::fresh(now),
                opened_at: now,
                half_open_successes: 0,
                forced: None,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker lock poisoned").state
    }

    /// `true` while the breaker is allowing traffic at full or reduced
    /// weight; the weight computer (C8) turns this into an actual
    /// percentage via [`crate::weight_computer`].
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.forced = Some(CircuitState::Open);
        self.transition(&mut inner, CircuitState::Open);
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.forced = Some(CircuitState::Closed);
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Clears a manual override and lets probe outcomes drive the state
    /// machine again.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.forced = None;
        inner.window = Window::fresh(Instant::now());
        self.transition(&mut inner, CircuitState::Closed);
        let _ = self.events.send(ControlEvent::CircuitChanged {
            target: self.target.clone(),
            state: "reset",
        });
    }

    /// Records a health-probe outcome and advances the state machine.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        if inner.forced.is_some() {
            return;
        }
        self.apply(&mut inner, success);
    }

    /// Applies one outcome to the current state. When a state's deadline
    /// has elapsed (`Open` → `HalfOpen`), the transition happens first and
    /// the same outcome is then re-applied under the new state rather than
    /// discarded, so a success that triggers the transition also counts
    /// toward `half_open_requests`.
    fn apply(&self, inner: &mut Inner, success: bool) {
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                if now.duration_since(inner.window.started_at)
                    >= Duration::from_millis(self.config.window_size_ms)
                {
                    inner.window = Window::fresh(now);
                }
                inner.window.requests += 1;
                if !success {
                    inner.window.errors += 1;
                }
                let error_pct = if inner.window.requests == 0 {
                    0
                } else {
                    (inner.window.errors * 100) / inner.window.requests
                };
                if inner.window.requests >= self.config.min_requests
                    && error_pct >= u32::from(self.config.error_threshold_pct)
                {
                    self.transition(inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {
                if now.duration_since(inner.opened_at)
                    >= Duration::from_millis(self.config.open_duration_ms)
                {
                    self.transition(inner, CircuitState::HalfOpen);
                    self.apply(inner, success);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_requests {
                        self.transition(inner, CircuitState::Closed);
                    }
                } else {
                    self.transition(inner, CircuitState::Open);
                }
            }
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        inner.state = next;
        match next {
            CircuitState::Open => inner.opened_at = Instant::now(),
            CircuitState::HalfOpen => inner.half_open_successes = 0,
            CircuitState::Closed => inner.window = Window::fresh(Instant::now()),
        }
        let event = if next == CircuitState::Open {
            ControlEvent::CircuitChanged { target: self.target.clone(), state: "trip" }
        } else {
            ControlEvent::CircuitChanged { target: self.target.clone(), state: next.as_str() }
        };
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            window_size_ms: 60_000,
            min_requests: 10,
            error_threshold_pct: 50,
            open_duration_ms: 0,
            half_open_requests: 3,
        }
    }

    #[test]
    fn ten_failures_out_of_ten_trips_open() {
        let breaker = CircuitBreaker::new("x", config());
        for _ in 0..10 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_closes_after_three_successes() {
        let breaker = CircuitBreaker::new("x", config());
        for _ in 0..10 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        // open_duration_ms is 0 in this config, so the next record() call
        // observes the deadline has already elapsed.
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(true);
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new("x", config());
        for _ in 0..10 {
            breaker.record(false);
        }
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn force_open_overrides_probe_outcomes() {
        let breaker = CircuitBreaker::new("x", config());
        breaker.force_open();
        for _ in 0..10 {
            breaker.record(true);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
