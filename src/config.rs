//! Configuration surface for the orchestrator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default checkpoint TTL in seconds.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Default exponential backoff schedule in seconds.
pub const DEFAULT_BACKOFF_SECS: [u64; 3] = [2, 4, 8];

/// Default consecutive failures before a breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open breaker waits before probing.
pub const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 60;

/// Default consecutive half-open successes before a breaker closes.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Default confidence floor below which a chain collapses.
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.5;

/// Default cap on chained low-confidence steps.
pub const DEFAULT_CHAIN_DEPTH_CAP: u32 = 3;

/// Default adversarial disagreement threshold.
pub const DEFAULT_SYCOPHANCY_THRESHOLD: f64 = 0.30;

/// Default per-step confidence decay base.
pub const DEFAULT_DEPTH_DECAY: f64 = 0.9;

/// Outgoing confidence below this boundary counts toward the
/// low-confidence streak that the chain-depth cap bounds.
pub const LOW_CONFIDENCE_BOUNDARY: f64 = 0.7;

/// Flagged risks are normalized by this ceiling in the disagreement score.
pub const RISK_CEILING: f64 = 5.0;

/// Maximum checkpoints the verifier retains before evicting the oldest.
pub const DEFAULT_MAX_CHECKPOINTS: usize = 1000;

/// Tunable thresholds and limits for a run.
///
/// The defaults match the documented behavior of every component; tests
/// shrink the time-based ones to keep suites fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum tasks executing concurrently within a level.
    pub fan_out_limit: usize,
    /// Default checkpoint TTL.
    pub default_ttl: Duration,
    /// Sleep durations between retry attempts; the last entry repeats.
    pub backoff_schedule: Vec<Duration>,
    /// Consecutive failures before an agent's breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long an open breaker rejects calls before probing.
    pub breaker_open_timeout: Duration,
    /// Consecutive half-open successes before the breaker closes.
    pub breaker_success_threshold: u32,
    /// Concurrent probes admitted while half-open.
    pub breaker_half_open_max_probes: u32,
    /// Outgoing confidence below this fails the task.
    pub confidence_floor: f64,
    /// Maximum chained low-confidence steps before collapse.
    pub chain_depth_cap: u32,
    /// Disagreement score above this flags human review.
    pub sycophancy_threshold: f64,
    /// Per-step confidence decay base, raised to the chain depth.
    pub depth_decay: f64,
    /// Checkpoints retained before the oldest is evicted.
    pub max_checkpoints: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fan_out_limit: 4,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            backoff_schedule: DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            breaker_failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            breaker_open_timeout: Duration::from_secs(DEFAULT_OPEN_TIMEOUT_SECS),
            breaker_success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            breaker_half_open_max_probes: 1,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            chain_depth_cap: DEFAULT_CHAIN_DEPTH_CAP,
            sycophancy_threshold: DEFAULT_SYCOPHANCY_THRESHOLD,
            depth_decay: DEFAULT_DEPTH_DECAY,
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
        }
    }
}

impl OrchestratorConfig {
    /// Config with a specific fan-out limit.
    pub fn with_fan_out(fan_out_limit: usize) -> Self {
        Self {
            fan_out_limit: fan_out_limit.max(1),
            ..Default::default()
        }
    }

    /// Replace the backoff schedule.
    pub fn backoff(mut self, schedule: Vec<Duration>) -> Self {
        self.backoff_schedule = schedule;
        self
    }

    /// Replace the default checkpoint TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Backoff duration for a given retry attempt (0-based). The last
    /// schedule entry repeats for attempts beyond its length; an empty
    /// schedule means no sleep.
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        match self.backoff_schedule.len() {
            0 => Duration::ZERO,
            n => self.backoff_schedule[attempt.min(n - 1)],
        }
    }
}
