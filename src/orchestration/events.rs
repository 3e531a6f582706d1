//! Observability events emitted during a run.
//!
//! Events go to a caller-provided sink; the orchestrator never requires
//! one. Each event is wrapped in an envelope carrying the run id and a
//! monotonic sequence number so a consumer can totally order what it
//! receives, and emission never blocks the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent::AgentId;
use crate::breaker::CircuitState;
use crate::core::task::{TaskId, TaskState};
use crate::orchestration::RunId;
use crate::verifier::CheckpointId;

/// The five behavioral guardrails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailKind {
    Sycophancy,
    Desync,
    HallucinatedDependency,
    ConfidenceCollapse,
    PhantomSuccess,
}

impl std::fmt::Display for GuardrailKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardrailKind::Sycophancy => write!(f, "sycophancy"),
            GuardrailKind::Desync => write!(f, "desync"),
            GuardrailKind::HallucinatedDependency => write!(f, "hallucinated_dependency"),
            GuardrailKind::ConfidenceCollapse => write!(f, "confidence_collapse"),
            GuardrailKind::PhantomSuccess => write!(f, "phantom_success"),
        }
    }
}

/// Events emitted for run lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum OrchestratorEvent {
    /// A task moved to a new state.
    TaskStateChanged { task_id: TaskId, state: TaskState },
    /// A checkpoint was sealed at a task boundary.
    CheckpointSealed {
        task_id: TaskId,
        checkpoint_id: CheckpointId,
        state_hash: String,
    },
    /// A guardrail fired. Firing does not imply the task failed.
    GuardrailTriggered {
        kind: GuardrailKind,
        task_id: Option<TaskId>,
        detail: String,
    },
    /// An agent's breaker changed state.
    BreakerTransition {
        agent_id: AgentId,
        from: CircuitState,
        to: CircuitState,
    },
    /// The scheduler rolled back to a last-good checkpoint.
    RollbackDecision {
        failed_task: TaskId,
        last_good: Option<CheckpointId>,
        rolled_back: Vec<TaskId>,
    },
    /// A decision record was appended to the audit log.
    DecisionLogged {
        task_id: TaskId,
        agent_id: AgentId,
        confidence: f64,
    },
}

/// Envelope adding run identity and ordering to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub run_id: RunId,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OrchestratorEvent,
}

/// Non-blocking, sequence-stamping event emitter.
///
/// Cloneable handle shared by the scheduler and pipeline; all clones
/// draw from the same sequence counter.
#[derive(Clone)]
pub struct EventSink {
    run_id: RunId,
    tx: Option<mpsc::UnboundedSender<EventEnvelope>>,
    seq: std::sync::Arc<AtomicU64>,
}

impl EventSink {
    /// A sink that forwards to a caller-provided channel.
    pub fn new(run_id: RunId, tx: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        Self {
            run_id,
            tx: Some(tx),
            seq: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sink that discards everything.
    pub fn disabled(run_id: RunId) -> Self {
        Self {
            run_id,
            tx: None,
            seq: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event. Sequence numbers advance even when no receiver is
    /// attached, so `inspect` counts stay meaningful.
    pub fn emit(&self, event: OrchestratorEvent) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            let _ = tx.send(EventEnvelope {
                run_id: self.run_id,
                seq,
                at: Utc::now(),
                event,
            });
        }
    }

    /// Events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}
