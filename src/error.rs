use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Submission rejected ({kind}): {message}")]
    Submission { kind: FailureKind, message: String },

    #[error("Agent not registered: {0}")]
    UnknownAgent(String),

    #[error("Run not found: {0}")]
    RunNotFound(uuid::Uuid),

    #[error("Run {0} has already been driven to completion")]
    RunConsumed(uuid::Uuid),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Cannot build a Merkle tree from zero leaves")]
    EmptyMerkle,

    #[error("Merkle proof index {index} out of range for {leaves} leaves")]
    ProofIndexOutOfRange { index: usize, leaves: usize },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Typed failure taxonomy.
///
/// Every task or submission failure in the system is reported as one of
/// these kinds. Retryability is a property of the kind, not of the call
/// site: the pipeline retries exactly the kinds `is_retryable` admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    // Submission errors: fatal to the whole submission, nothing runs.
    CircularDependency,
    HallucinatedDependency,
    SchemaRejected,
    DuplicateTask,
    UnknownAgent,

    // Task-scoped, retryable.
    AgentTimeout,
    AgentTransient,
    BreakerHalfOpenReject,

    // Task-scoped, non-retryable.
    IntegrityViolation,
    ToolPhantomSuccess,
    ConfidenceCollapse,
    SchemaViolation,
    SycophancySuspected,

    // Breaker gating. Not retryable for this attempt; future submissions
    // may succeed once the breaker closes.
    BreakerOpen,

    // Verifier verdicts surfaced as failures.
    CheckpointExpired,
    CheckpointMismatch,
}

impl FailureKind {
    /// Whether the pipeline may retry an attempt that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::AgentTimeout
                | FailureKind::AgentTransient
                | FailureKind::BreakerHalfOpenReject
        )
    }

    /// Whether this kind rejects a submission before any task executes.
    pub fn is_submission(&self) -> bool {
        matches!(
            self,
            FailureKind::CircularDependency
                | FailureKind::HallucinatedDependency
                | FailureKind::SchemaRejected
                | FailureKind::DuplicateTask
                | FailureKind::UnknownAgent
        )
    }

    /// Whether a failure of this kind skips remaining retries and goes
    /// straight to rollback.
    pub fn forces_rollback(&self) -> bool {
        matches!(
            self,
            FailureKind::IntegrityViolation | FailureKind::ConfidenceCollapse
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::CircularDependency => "CIRCULAR_DEPENDENCY",
            FailureKind::HallucinatedDependency => "HALLUCINATED_DEPENDENCY",
            FailureKind::SchemaRejected => "SCHEMA_REJECTED",
            FailureKind::DuplicateTask => "DUPLICATE_TASK",
            FailureKind::UnknownAgent => "UNKNOWN_AGENT",
            FailureKind::AgentTimeout => "AGENT_TIMEOUT",
            FailureKind::AgentTransient => "AGENT_TRANSIENT",
            FailureKind::BreakerHalfOpenReject => "BREAKER_HALF_OPEN_REJECT",
            FailureKind::IntegrityViolation => "INTEGRITY_VIOLATION",
            FailureKind::ToolPhantomSuccess => "TOOL_PHANTOM_SUCCESS",
            FailureKind::ConfidenceCollapse => "CONFIDENCE_COLLAPSE",
            FailureKind::SchemaViolation => "SCHEMA_VIOLATION",
            FailureKind::SycophancySuspected => "SYCOPHANCY_SUSPECTED",
            FailureKind::BreakerOpen => "BREAKER_OPEN",
            FailureKind::CheckpointExpired => "CHECKPOINT_EXPIRED",
            FailureKind::CheckpointMismatch => "CHECKPOINT_MISMATCH",
        };
        write!(f, "{}", name)
    }
}
