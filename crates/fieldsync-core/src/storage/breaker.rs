//! Circuit breaker guarding cloud storage calls.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use super::object_store::CloudError;
use crate::clock::{duration_millis, Clock};

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes that close it again.
    pub success_threshold: u32,
    /// Time the circuit stays open before probing.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<i64>,
}

/// Breaker counters. Every transition produces a new value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BreakerState {
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<i64>,
    circuit_open: bool,
    half_open: bool,
}

impl BreakerState {
    /// Decide whether a call may proceed at `now`.
    fn admit(self, config: &BreakerConfig, now: i64) -> Result<Self, CloudError> {
        if !self.circuit_open {
            return Ok(self);
        }
        let cooled = match self.last_failure_at {
            None => true,
            Some(at) => now.saturating_sub(at) >= duration_millis(config.cooldown),
        };
        if cooled {
            Ok(Self {
                circuit_open: false,
                half_open: true,
                success_count: 0,
                ..self
            })
        } else {
            Err(CloudError::CircuitOpen)
        }
    }

    fn on_success(self, config: &BreakerConfig) -> Self {
        if self.half_open {
            let success_count = self.success_count + 1;
            if success_count >= config.success_threshold {
                return Self {
                    failure_count: 0,
                    success_count: 0,
                    half_open: false,
                    ..self
                };
            }
            return Self {
                success_count,
                ..self
            };
        }
        Self {
            failure_count: 0,
            ..self
        }
    }

    fn on_failure(self, config: &BreakerConfig, now: i64) -> Self {
        let failure_count = self.failure_count.saturating_add(1);
        let open = self.half_open || failure_count >= config.failure_threshold;
        Self {
            failure_count,
            success_count: 0,
            last_failure_at: Some(now),
            circuit_open: open,
            half_open: false,
        }
    }

    const fn state(&self) -> CircuitState {
        if self.circuit_open {
            CircuitState::Open
        } else if self.half_open {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }
}

/// Thread-safe breaker; all transitions happen under one lock.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn transition<T>(&self, step: impl FnOnce(BreakerState) -> (BreakerState, T)) -> T {
        // Counters stay consistent even if a holder panicked
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (next, out) = step(*guard);
        if next.state() != guard.state() {
            tracing::info!(from = ?guard.state(), to = ?next.state(), "Cloud storage circuit changed state");
        }
        *guard = next;
        out
    }

    /// Admit a call or fail fast while open.
    pub fn admit(&self) -> Result<(), CloudError> {
        let now = self.clock.now_millis();
        self.transition(|state| match state.admit(&self.config, now) {
            Ok(next) => (next, Ok(())),
            Err(error) => (state, Err(error)),
        })
    }

    pub fn record_success(&self) {
        self.transition(|state| (state.on_success(&self.config), ()));
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        self.transition(|state| (state.on_failure(&self.config, now), ()));
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        BreakerSnapshot {
            state: state.state(),
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_at: state.last_failure_at,
        }
    }
}
