//! Per-server circuit breaker
//!
//! ```text
//!            failures >= threshold
//!   Closed ------------------------> Open
//!     ^                               |
//!     | successes >= success_thr.     | cooldown elapsed
//!     |                               v
//!     +--------------------------- HalfOpen --(trial fails)--> Open
//! ```
//!
//! `HalfOpen` admits one trial call at a time. Callers take a
//! [`CircuitPermit`] with [`CircuitBreaker::permit`] before the call and settle
//! it with [`CircuitPermit::success`] / [`CircuitPermit::failure`] after it.
//! A permit dropped unsettled (the call was cancelled) counts as a failed
//! trial, so a half-open breaker never stays stuck waiting on it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful trials needed to close a half-open breaker
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time an open breaker rejects calls before allowing a trial
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(GatewayError::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            )
            .into());
        }
        if self.success_threshold == 0 {
            return Err(GatewayError::Config(
                "circuit_breaker.success_threshold must be at least 1".into(),
            )
            .into());
        }
        Ok(())
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub server_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition: DateTime<Utc>,
    /// Calls turned away without reaching the server
    pub rejected: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_transition: DateTime<Utc>,
    trial_in_flight: bool,
    rejected: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_transition: Utc::now(),
            trial_in_flight: false,
            rejected: 0,
        }
    }
}

/// Fail-fast guard for one server
#[derive(Debug)]
pub struct CircuitBreaker {
    server_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(server_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            server_id: server_id.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            events: None,
        }
    }

    /// Publish state changes on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. An open breaker whose cooldown has elapsed still
    /// reports `Open` until the next call attempt moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call would currently be turned away
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => !self.cooldown_elapsed(&inner),
            CircuitState::HalfOpen => inner.trial_in_flight,
        }
    }

    fn cooldown_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.cooldown())
    }

    /// Ask to make a call.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CircuitOpen`] while the breaker is open, or
    /// while a half-open trial is already in flight.
    pub fn try_acquire(&self) -> Result<()> {
        self.admit().map(|_| ())
    }

    /// Like [`CircuitBreaker::try_acquire`], but the admission is tied to a
    /// guard that settles the breaker even when the call never finishes.
    ///
    /// # Errors
    ///
    /// Same as [`CircuitBreaker::try_acquire`].
    pub fn permit(&self) -> Result<CircuitPermit<'_>> {
        let trial = self.admit()?;
        Ok(CircuitPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Returns whether the admitted call is the half-open trial
    fn admit(&self) -> Result<bool> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open if self.cooldown_elapsed(inner) => {
                self.transition(inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(true)
            }
            _ => {
                inner.rejected += 1;
                Err(GatewayError::CircuitOpen(self.server_id.clone()).into())
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => inner.consecutive_successes += 1,
            // A call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.transition(inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                self.transition(inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.state != CircuitState::Closed {
            self.transition(inner, CircuitState::Closed);
        }
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.trial_in_flight = false;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            server_id: self.server_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_transition: inner.last_transition,
            rejected: inner.rejected,
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_transition = Utc::now();
        match to {
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => inner.consecutive_successes = 0,
        }

        match to {
            CircuitState::Open => tracing::warn!(
                server = %self.server_id,
                failures = inner.consecutive_failures,
                "circuit {from} -> {to}"
            ),
            _ => tracing::info!(server = %self.server_id, "circuit {from} -> {to}"),
        }
        if let Some(events) = &self.events {
            events.emit(GatewayEvent::CircuitStateChanged {
                server_id: self.server_id.clone(),
                from,
                to,
            });
        }
    }
}

/// Admission to call through a [`CircuitBreaker`]
///
/// Settle it with [`CircuitPermit::success`] or [`CircuitPermit::failure`].
/// Dropping an unsettled trial permit reopens the breaker; dropping an
/// unsettled permit taken while closed records nothing.
#[derive(Debug)]
#[must_use = "an unsettled permit counts as a failed trial"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        tracing::debug!(server = %self.breaker.server_id, "half-open trial abandoned");
        self.breaker.record_failure();
    }
}

/// One breaker per server, created on first use
#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: Option<EventBus>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            events: Some(events),
        }
    }

    pub fn get(&self, server_id: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
        {
            return Arc::clone(b);
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(server_id.to_string()).or_insert_with(|| {
            let breaker = CircuitBreaker::new(server_id, self.config.clone());
            Arc::new(match &self.events {
                Some(events) => breaker.with_events(events.clone()),
                None => breaker,
            })
        }))
    }

    /// Whether the server's breaker currently rejects calls. Servers without a
    /// breaker yet are closed.
    pub fn is_open(&self, server_id: &str) -> bool {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .is_some_and(|b| b.is_open())
    }

    pub fn remove(&self, server_id: &str) {
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
    }

    pub fn reset_all(&self) {
        for breaker in self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            breaker.reset();
        }
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|b| b.snapshot())
            .collect();
        out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        out
    }
}
