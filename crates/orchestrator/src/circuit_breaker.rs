//! Circuit Breaker (C3): per-actor-type CLOSED/OPEN/HALF_OPEN state, read
//! once per stage dispatch (never per task) and driven by task failures.
//!
//! State is kept in [`crate::state::StateStore`] rather than in-process,
//! since multiple orchestrator instances share the same backend and breaker
//! state is only eventually consistent across them (§5). Grounded on the
//! state-machine shape of `crates/oya-web/src/circuit_breaker.rs`, but the
//! transition rules follow the spec's consecutive-failure counter exactly
//! rather than that file's sliding time window.

use std::sync::Arc;

use chrono::Utc;

use crate::definition::CircuitBreakerConfig;
use crate::records::{BreakerState, CircuitBreakerState};
use crate::state::{Result, StateStore};

pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Seed a breaker record for `actor_type` from the stage's
    /// `circuitBreaker` config the first time it is seen. A later stage
    /// reusing the same actor type with a different config does not reset
    /// counters — only a fresh actor type gets a fresh record.
    pub async fn ensure_config(&self, actor_type: &str, config: &CircuitBreakerConfig) -> Result<()> {
        if self.store.get_circuit_breaker(actor_type).await?.is_none() {
            self.store
                .save_circuit_breaker(CircuitBreakerState::closed(
                    actor_type,
                    config.failure_threshold,
                    config.timeout_ms,
                    config.half_open_requests,
                ))
                .await?;
        }
        Ok(())
    }

    /// Called once per stage dispatch. Applies the OPEN → HALF_OPEN timeout
    /// transition if due, then decides whether this dispatch may proceed,
    /// atomically bumping `half_open_attempts` when it allows a probe.
    pub async fn should_allow(&self, actor_type: &str) -> Result<bool> {
        let Some(mut state) = self.store.get_circuit_breaker(actor_type).await? else {
            // No breaker configured for this actor type: always allow.
            return Ok(true);
        };

        let now = Utc::now();
        if state.state == BreakerState::Open {
            if let Some(last_failure) = state.last_failure_time {
                let reopen_at = last_failure + chrono::Duration::milliseconds(state.timeout_ms as i64);
                if now >= reopen_at {
                    state.state = BreakerState::HalfOpen;
                    state.half_open_attempts = 0;
                    state.half_open_successes = 0;
                }
            }
        }

        let allow = match state.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => state.half_open_attempts < state.half_open_requests,
        };

        if allow && state.state == BreakerState::HalfOpen {
            state.half_open_attempts = state.half_open_attempts.saturating_add(1);
        }

        self.store.save_circuit_breaker(state).await?;
        Ok(allow)
    }

    /// CLOSED on success clears the failure counter; HALF_OPEN closes once
    /// `half_open_successes >= half_open_requests`.
    pub async fn record_success(&self, actor_type: &str) -> Result<()> {
        let Some(mut state) = self.store.get_circuit_breaker(actor_type).await? else {
            return Ok(());
        };
        match state.state {
            BreakerState::Closed => state.failures = 0,
            BreakerState::HalfOpen => {
                state.half_open_successes = state.half_open_successes.saturating_add(1);
                if state.half_open_successes >= state.half_open_requests {
                    state.state = BreakerState::Closed;
                    state.failures = 0;
                    state.half_open_attempts = 0;
                    state.half_open_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
        self.store.save_circuit_breaker(state).await
    }

    /// CLOSED → OPEN once failures reach `failure_threshold`; any failure in
    /// HALF_OPEN immediately reopens.
    pub async fn record_failure(&self, actor_type: &str) -> Result<()> {
        let Some(mut state) = self.store.get_circuit_breaker(actor_type).await? else {
            return Ok(());
        };
        let now = Utc::now();
        match state.state {
            BreakerState::Closed => {
                state.failures = state.failures.saturating_add(1);
                if state.failures >= state.failure_threshold {
                    state.state = BreakerState::Open;
                    state.last_failure_time = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                state.state = BreakerState::Open;
                state.last_failure_time = Some(now);
                state.half_open_attempts = 0;
                state.half_open_successes = 0;
            }
            BreakerState::Open => {
                state.last_failure_time = Some(now);
            }
        }
        self.store.save_circuit_breaker(state).await
    }
}
