//! Inter-agent payload model.
//!
//! An `AgentPayload` is the typed message a completed agent emits. It is
//! hash-sealed over its body, confidence-scored, and carries the audit
//! trail (reasoning, assumptions, alternatives) that makes downstream
//! review possible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentId;
use crate::core::task::TaskId;
use crate::hash::hash_value;

/// Categorical confidence bands derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLevel {
    /// Map a confidence score to its band.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            ConfidenceLevel::VeryHigh
        } else if score >= 0.7 {
            ConfidenceLevel::High
        } else if score >= 0.5 {
            ConfidenceLevel::Medium
        } else if score >= 0.3 {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceLevel::VeryHigh => write!(f, "very_high"),
            ConfidenceLevel::High => write!(f, "high"),
            ConfidenceLevel::Medium => write!(f, "medium"),
            ConfidenceLevel::Low => write!(f, "low"),
            ConfidenceLevel::VeryLow => write!(f, "very_low"),
        }
    }
}

/// A declared assumption with its own confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assumption {
    pub description: String,
    pub confidence: f64,
}

/// Metadata block attached to a payload.
///
/// `success` is the explicit success indicator the invocation contract
/// requires; a payload that omits it (or sets it false) is treated as a
/// phantom success by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PayloadMetadata {
    /// Explicit success indicator. Must be `Some(true)` for the payload
    /// to be accepted.
    pub success: Option<bool>,
    /// Set by the pipeline when an adversarial review disagrees enough
    /// to warrant a human look. Never fails the task by itself.
    #[serde(default)]
    pub requires_human_review: bool,
    /// Marks the producing task as high-stakes, forcing the adversarial
    /// cross-check even for non-publisher roles.
    #[serde(default)]
    pub high_stakes: bool,
    /// Free-form extras (validation reports, adversarial summaries).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// The message a completed agent emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPayload {
    /// Task this payload was produced for.
    pub task_id: TaskId,
    /// Agent that produced it.
    pub agent_id: AgentId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Structured payload body.
    pub body: Value,
    /// SHA-256 over the canonical encoding of `body`.
    pub content_hash: String,
    /// Confidence score in [0, 1].
    pub confidence: f64,
    /// Upstream task ids whose outputs this payload consumed.
    pub consumed: Vec<TaskId>,
    /// Free-text reasoning trace.
    pub reasoning_trace: String,
    /// Declared assumptions.
    pub assumptions: Vec<Assumption>,
    /// Alternatives the agent considered and rejected.
    pub alternatives: Vec<String>,
    /// Metadata block.
    pub metadata: PayloadMetadata,
}

impl AgentPayload {
    /// Create a sealed payload: the content hash is computed from the
    /// body at construction time.
    pub fn new(task_id: TaskId, agent_id: AgentId, body: Value, confidence: f64) -> Self {
        let content_hash = hash_value(&body);
        Self {
            task_id,
            agent_id,
            created_at: Utc::now(),
            body,
            content_hash,
            confidence,
            consumed: Vec::new(),
            reasoning_trace: String::new(),
            assumptions: Vec::new(),
            alternatives: Vec::new(),
            metadata: PayloadMetadata {
                success: Some(true),
                ..Default::default()
            },
        }
    }

    /// Set the upstream task ids this payload consumed.
    pub fn with_consumed(mut self, consumed: Vec<TaskId>) -> Self {
        self.consumed = consumed;
        self
    }

    /// Attach a reasoning trace.
    pub fn with_reasoning(mut self, trace: impl Into<String>) -> Self {
        self.reasoning_trace = trace.into();
        self
    }

    /// Declare an assumption.
    pub fn with_assumption(mut self, description: impl Into<String>, confidence: f64) -> Self {
        self.assumptions.push(Assumption {
            description: description.into(),
            confidence,
        });
        self
    }

    /// Set the explicit success indicator.
    pub fn with_success(mut self, success: Option<bool>) -> Self {
        self.metadata.success = success;
        self
    }

    /// Recompute the canonical hash of the body.
    pub fn compute_hash(&self) -> String {
        hash_value(&self.body)
    }

    /// Whether the stored hash matches a recomputation over the body.
    pub fn verify_integrity(&self) -> bool {
        self.compute_hash() == self.content_hash
    }

    /// Whether the confidence score lies in the closed interval [0, 1].
    pub fn confidence_in_range(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }

    /// Categorical confidence band.
    pub fn confidence_level(&self) -> ConfidenceLevel {
        ConfidenceLevel::from_score(self.confidence)
    }

    /// Re-seal the hash after the pipeline mutates the body (output
    /// integrity sealing, step 5).
    pub fn reseal(&mut self) {
        self.content_hash = self.compute_hash();
    }
}
