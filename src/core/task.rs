//! Task data model for the execution DAG.
//!
//! A `TaskNode` is the immutable description a caller submits: identity,
//! dependencies, the agent that should run it, schemas, and limits. A
//! `TaskRecord` is the scheduler-owned mutable bookkeeping that tracks
//! the node through its state machine. No component other than the
//! scheduler mutates records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentId;
use crate::error::FailureKind;
use crate::payload::AgentPayload;
use crate::verifier::CheckpointId;

/// Caller-supplied opaque identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a task may be scheduled relative to its level peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelHint {
    /// Must run alone, in insertion order among serial peers.
    SerialRequired,
    /// May share the level's fan-out budget.
    #[default]
    CanParallelize,
    /// Prefers to share the fan-out budget; scheduled with the
    /// can-parallelize group.
    ParallelPreferred,
}

impl ParallelHint {
    pub fn is_serial(&self) -> bool {
        matches!(self, ParallelHint::SerialRequired)
    }
}

/// Immutable description of one unit of work.
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// Opaque task id, unique within a submission.
    pub id: TaskId,
    /// Upstream task ids whose outputs this task consumes.
    pub dependencies: Vec<TaskId>,
    /// Agent that executes this task.
    pub agent_id: AgentId,
    /// Scheduling hint.
    pub parallel_hint: ParallelHint,
    /// JSON schema the upstream payload bodies must satisfy.
    pub input_schema: Option<Value>,
    /// JSON schema the produced payload body must satisfy.
    pub output_schema: Option<Value>,
    /// Per-invocation deadline.
    pub timeout: Duration,
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    /// Whether the task may be re-run against rolled-back state without
    /// user intervention.
    pub idempotent: bool,
    /// Marks this task high-stakes regardless of role.
    pub high_stakes: bool,
    /// Optional validator agent for the confidence cross-check.
    pub validator: Option<AgentId>,
    /// Optional adversarial agent for the disagreement review.
    pub adversary: Option<AgentId>,
}

impl TaskNode {
    /// Create a node with defaults: 30 s timeout, 3 retries, parallel,
    /// not idempotent, no cross-check agents.
    pub fn new(id: impl Into<TaskId>, agent_id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            agent_id: agent_id.into(),
            parallel_hint: ParallelHint::default(),
            input_schema: None,
            output_schema: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            idempotent: false,
            high_stakes: false,
            validator: None,
            adversary: None,
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<TaskId>>) -> Self {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn hint(mut self, hint: ParallelHint) -> Self {
        self.parallel_hint = hint;
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn high_stakes(mut self, high_stakes: bool) -> Self {
        self.high_stakes = high_stakes;
        self
    }

    pub fn validated_by(mut self, validator: impl Into<AgentId>) -> Self {
        self.validator = Some(validator.into());
        self
    }

    pub fn challenged_by(mut self, adversary: impl Into<AgentId>) -> Self {
        self.adversary = Some(adversary.into());
        self
    }
}

/// Task lifecycle states.
///
/// PENDING → READY → RUNNING → (SUCCESS | FAILED | RETRYING | ROLLED_BACK).
/// RETRYING returns to RUNNING on the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Created but upstream tasks are not all done.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for dispatch.
    Ready,
    /// An attempt is executing.
    Running,
    /// Terminal: produced a sealed payload.
    Success,
    /// Terminal: exhausted retries or hit a non-retryable failure.
    Failed {
        kind: FailureKind,
        error: String,
    },
    /// Between attempts, waiting out the backoff.
    Retrying {
        attempt: u32,
    },
    /// Produced work was discarded by a rollback.
    RolledBack,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed { .. } | TaskState::RolledBack
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Success => write!(f, "success"),
            TaskState::Failed { kind, error } => write!(f, "failed ({}): {}", kind, error),
            TaskState::Retrying { attempt } => write!(f, "retrying (attempt {})", attempt),
            TaskState::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// One failed attempt, kept in the retry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub kind: FailureKind,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Scheduler-owned bookkeeping for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub state: TaskState,
    pub retry_count: u32,
    pub last_error: Option<FailureKind>,
    /// Checkpoint sealed at this task's boundary, once successful.
    pub checkpoint_id: Option<CheckpointId>,
    /// Final produced payload; discarded again on rollback.
    pub payload: Option<AgentPayload>,
    /// Failed attempts, in order.
    pub retry_history: Vec<AttemptFailure>,
    /// Longest path from a root to this task.
    pub chain_depth: u32,
    /// Consecutive low-confidence steps ending at this task.
    pub low_confidence_streak: u32,
}

impl TaskRecord {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            retry_count: 0,
            last_error: None,
            checkpoint_id: None,
            payload: None,
            retry_history: Vec::new(),
            chain_depth: 0,
            low_confidence_streak: 0,
        }
    }

    pub fn mark_ready(&mut self) {
        self.state = TaskState::Ready;
    }

    pub fn start(&mut self) {
        self.state = TaskState::Running;
    }

    pub fn retrying(&mut self, attempt: u32, kind: FailureKind, error: &str) {
        self.retry_count = attempt;
        self.last_error = Some(kind);
        self.retry_history.push(AttemptFailure {
            attempt,
            kind,
            error: error.to_string(),
            at: Utc::now(),
        });
        self.state = TaskState::Retrying { attempt };
    }

    pub fn succeed(&mut self, payload: AgentPayload, checkpoint_id: CheckpointId) {
        self.payload = Some(payload);
        self.checkpoint_id = Some(checkpoint_id);
        self.state = TaskState::Success;
    }

    pub fn fail(&mut self, kind: FailureKind, error: &str) {
        self.last_error = Some(kind);
        self.state = TaskState::Failed {
            kind,
            error: error.to_string(),
        };
    }

    /// Discard produced work after a rollback.
    pub fn roll_back(&mut self) {
        self.payload = None;
        self.state = TaskState::RolledBack;
    }
}
