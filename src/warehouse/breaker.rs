//! Per-account circuit breakers.
//!
//! Each warehouse account gets an independent closed/open/half-open state
//! machine. Failures within a rolling window open the circuit; after a
//! cooldown a bounded probe quota is admitted; enough consecutive probe
//! successes close it again. Repeated half-open failures compound the
//! cooldown up to a ceiling.
//!
//! State changes and call outcomes are published on a notification channel
//! consumed by the health monitor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `window` required to open a closed circuit.
    pub failure_threshold: u32,
    pub window: Duration,
    /// How long an open circuit blocks before admitting a probe.
    pub cooldown: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Ceiling for compounded cooldowns.
    pub max_backoff: Duration,
    /// Concurrent probes admitted in half-open.
    pub probe_quota: u32,
    /// A held probe slot is reclaimed after this long, so no caller can
    /// starve others by never reporting an outcome. Set to the warehouse
    /// call deadline.
    pub probe_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
            max_backoff: Duration::from_secs(300),
            probe_quota: 1,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

/// Notification published to the health monitor.
#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub account: String,
    pub kind: BreakerEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum BreakerEventKind {
    StateChange {
        from: CircuitState,
        to: CircuitState,
    },
    Failure,
    Success,
}

/// Point-in-time view of one breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures_in_window: u32,
    pub half_open_successes: u32,
    /// Milliseconds since the last state change.
    pub since_change_ms: u64,
}

struct BreakerState {
    state: CircuitState,
    /// Failure timestamps inside the rolling window.
    failures: Vec<Instant>,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    probes_in_flight: u32,
    probe_taken_at: Option<Instant>,
    last_transition: Instant,
}

impl BreakerState {
    fn new(base_cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: Vec::new(),
            half_open_successes: 0,
            opened_at: None,
            current_cooldown: base_cooldown,
            probes_in_flight: 0,
            probe_taken_at: None,
            last_transition: Instant::now(),
        }
    }
}

/// Registry of breakers keyed by account username.
pub struct CircuitBreakerRegistry {
    cfg: BreakerConfig,
    states: Mutex<HashMap<String, BreakerState>>,
    events_tx: mpsc::UnboundedSender<BreakerEvent>,
}

impl CircuitBreakerRegistry {
    /// Returns the registry plus the notification stream the health monitor
    /// consumes.
    pub fn new(cfg: BreakerConfig) -> (Self, mpsc::UnboundedReceiver<BreakerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                cfg,
                states: Mutex::new(HashMap::new()),
                events_tx,
            },
            events_rx,
        )
    }

    fn emit(&self, account: &str, kind: BreakerEventKind) {
        let _ = self.events_tx.send(BreakerEvent {
            account: account.to_string(),
            kind,
            at: Utc::now(),
        });
    }

    fn transition(&self, account: &str, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        state.last_transition = Instant::now();
        tracing::info!(account, ?from, ?to, "circuit state change");
        self.emit(account, BreakerEventKind::StateChange { from, to });
    }

    /// Whether a call against this account may proceed right now.
    ///
    /// In `open`, the cooldown is checked and an elapsed one moves the
    /// circuit to `half_open` in the same reading. In `half_open`, a probe
    /// slot is taken; the caller must report an outcome via
    /// [`record_success`](Self::record_success) /
    /// [`record_failure`](Self::record_failure) or the slot is reclaimed
    /// after `probe_timeout`.
    pub fn can_execute(&self, account: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(account.to_string())
            .or_insert_with(|| BreakerState::new(self.cfg.cooldown));

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed() >= state.current_cooldown)
                    .unwrap_or(true);
                if !elapsed {
                    return false;
                }
                self.transition(account, state, CircuitState::HalfOpen);
                state.half_open_successes = 0;
                state.probes_in_flight = 1;
                state.probe_taken_at = Some(Instant::now());
                true
            }
            CircuitState::HalfOpen => {
                // Reclaim a stale probe slot so one caller cannot starve
                // the rest of the system.
                if state.probes_in_flight > 0 {
                    if let Some(taken) = state.probe_taken_at {
                        if taken.elapsed() >= self.cfg.probe_timeout {
                            state.probes_in_flight = 0;
                        }
                    }
                }
                if state.probes_in_flight < self.cfg.probe_quota {
                    state.probes_in_flight += 1;
                    state.probe_taken_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, account: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(account.to_string())
            .or_insert_with(|| BreakerState::new(self.cfg.cooldown));

        match state.state {
            CircuitState::Closed => {
                state.failures.clear();
            }
            CircuitState::HalfOpen => {
                state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
                state.half_open_successes += 1;
                if state.half_open_successes >= self.cfg.success_threshold {
                    state.failures.clear();
                    state.current_cooldown = self.cfg.cooldown;
                    state.opened_at = None;
                    self.transition(account, state, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
        self.emit(account, BreakerEventKind::Success);
    }

    pub fn record_failure(&self, account: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(account.to_string())
            .or_insert_with(|| BreakerState::new(self.cfg.cooldown));
        let now = Instant::now();

        match state.state {
            CircuitState::Closed => {
                state.failures.push(now);
                let window = self.cfg.window;
                state.failures.retain(|t| now.duration_since(*t) <= window);
                if state.failures.len() as u32 >= self.cfg.failure_threshold {
                    state.opened_at = Some(now);
                    self.transition(account, state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any probe failure reopens with a compounded cooldown.
                state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
                state.opened_at = Some(now);
                state.current_cooldown =
                    (state.current_cooldown * 2).min(self.cfg.max_backoff);
                self.transition(account, state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
        self.emit(account, BreakerEventKind::Failure);
    }

    /// Current state without side effects (no lazy open→half_open move).
    pub fn state(&self, account: &str) -> CircuitState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .get(account)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Admin reset: force the circuit closed and clear counters.
    pub fn reset(&self, account: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(account.to_string())
            .or_insert_with(|| BreakerState::new(self.cfg.cooldown));
        state.failures.clear();
        state.half_open_successes = 0;
        state.probes_in_flight = 0;
        state.probe_taken_at = None;
        state.opened_at = None;
        state.current_cooldown = self.cfg.cooldown;
        self.transition(account, state, CircuitState::Closed);
    }

    pub fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .iter()
            .map(|(account, s)| {
                (
                    account.clone(),
                    BreakerSnapshot {
                        state: s.state,
                        failures_in_window: s.failures.len() as u32,
                        half_open_successes: s.half_open_successes,
                        since_change_ms: s.last_transition.elapsed().as_millis() as u64,
                    },
                )
            })
            .collect()
    }
}
