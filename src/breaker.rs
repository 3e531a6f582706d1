//! Circuit breaker gating calls to flaky agents.
//!
//! One breaker per agent id, with the usual three states:
//! - Closed: calls flow normally.
//! - Open: calls are rejected until the open timeout elapses.
//! - HalfOpen: a bounded number of probes is admitted to test recovery.
//!
//! The breaker does no retrying itself; it is purely an admission layer.
//! Callers admit, run the call, then record the outcome.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::AgentId;
use crate::config::OrchestratorConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change, reported so callers can emit observability events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Outcome of asking the breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Call may proceed. `probe` marks a half-open trial call; pass it
    /// back to `record_success`/`record_failure`.
    Admitted { probe: bool },
    /// Breaker is open; the call must not be made.
    RejectedOpen,
    /// Breaker is half-open and all probe slots are taken. Retryable.
    RejectedHalfOpen,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::config::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: crate::config::DEFAULT_SUCCESS_THRESHOLD,
            open_timeout: Duration::from_secs(crate::config::DEFAULT_OPEN_TIMEOUT_SECS),
            half_open_max_probes: 1,
        }
    }
}

impl From<&OrchestratorConfig> for BreakerConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold,
            success_threshold: config.breaker_success_threshold,
            open_timeout: config.breaker_open_timeout,
            half_open_max_probes: config.breaker_half_open_max_probes,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    open_until: Option<Instant>,
}

/// Circuit breaker for a single agent.
pub struct CircuitBreaker {
    agent_id: AgentId,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(agent_id: AgentId, config: BreakerConfig) -> Self {
        Self {
            agent_id,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_in_flight: 0,
                open_until: None,
            }),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Current state, applying the open-timeout transition first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        self.check_timeout(&mut inner);
        inner.state
    }

    /// Ask whether a call may proceed.
    pub fn admit(&self) -> (Admission, Option<BreakerTransition>) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        let transition = self.check_timeout(&mut inner);

        let admission = match inner.state {
            CircuitState::Closed => Admission::Admitted { probe: false },
            CircuitState::Open => Admission::RejectedOpen,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_probes {
                    inner.half_open_in_flight += 1;
                    Admission::Admitted { probe: true }
                } else {
                    Admission::RejectedHalfOpen
                }
            }
        };

        (admission, transition)
    }

    /// Record a successful call.
    pub fn record_success(&self, probe: bool) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        if probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(
                        agent_id = %self.agent_id,
                        successes = inner.success_count,
                        "breaker closing after recovery"
                    );
                    Some(self.transition(&mut inner, CircuitState::Closed))
                } else {
                    None
                }
            }
            // A success while open can only be a stale probe; ignore it.
            CircuitState::Open => None,
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, probe: bool) -> Option<BreakerTransition> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        if probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        agent_id = %self.agent_id,
                        failures = inner.failure_count,
                        "breaker opening"
                    );
                    Some(self.transition(&mut inner, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                warn!(agent_id = %self.agent_id, "breaker re-opening after half-open failure");
                Some(self.transition(&mut inner, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    fn check_timeout(&self, inner: &mut Inner) -> Option<BreakerTransition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        match inner.open_until {
            Some(until) if Instant::now() >= until => {
                info!(agent_id = %self.agent_id, "breaker half-open after timeout");
                Some(self.transition(inner, CircuitState::HalfOpen))
            }
            _ => None,
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) -> BreakerTransition {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                inner.open_until = None;
            }
            CircuitState::Open => {
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                inner.open_until = Some(Instant::now() + self.config.open_timeout);
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
            }
        }
        BreakerTransition { from, to }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> BreakerStats {
        let state = self.state();
        let inner = self.inner.lock().expect("breaker poisoned");
        BreakerStats {
            agent_id: self.agent_id.clone(),
            state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }
}

/// Snapshot of one breaker's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub agent_id: AgentId,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// Process-wide registry: one breaker per agent id, created on first use.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<AgentId, std::sync::Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for an agent, created lazily.
    pub fn breaker(&self, agent_id: &AgentId) -> std::sync::Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().expect("breaker registry poisoned");
            if let Some(b) = breakers.get(agent_id) {
                return std::sync::Arc::clone(b);
            }
        }
        let mut breakers = self.breakers.write().expect("breaker registry poisoned");
        std::sync::Arc::clone(breakers.entry(agent_id.clone()).or_insert_with(|| {
            std::sync::Arc::new(CircuitBreaker::new(agent_id.clone(), self.config.clone()))
        }))
    }

    /// Invoke `f` only if the breaker admits it, recording the outcome.
    ///
    /// Returns the admission decision when rejected, otherwise the
    /// call's own result.
    pub async fn call_through<T, E, F, Fut>(
        &self,
        agent_id: &AgentId,
        f: F,
    ) -> CallOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
    {
        let breaker = self.breaker(agent_id);
        let (admission, _) = breaker.admit();
        let probe = match admission {
            Admission::Admitted { probe } => probe,
            Admission::RejectedOpen => return CallOutcome::RejectedOpen,
            Admission::RejectedHalfOpen => return CallOutcome::RejectedHalfOpen,
        };

        let result = f().await;
        match &result {
            Ok(_) => breaker.record_success(probe),
            Err(_) => breaker.record_failure(probe),
        };
        CallOutcome::Completed(result)
    }

    /// Snapshot of all breakers, sorted by agent id.
    pub fn stats(&self) -> Vec<BreakerStats> {
        let breakers = self.breakers.read().expect("breaker registry poisoned");
        let mut stats: Vec<BreakerStats> = breakers.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        stats
    }
}

/// Result of `call_through`.
#[derive(Debug)]
pub enum CallOutcome<T, E> {
    Completed(std::result::Result<T, E>),
    RejectedOpen,
    RejectedHalfOpen,
}
