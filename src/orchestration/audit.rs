//! Decision audit trail.
//!
//! Every pipeline run, successful or not, appends one record here. The
//! log is in-memory, scoped to a run, and returned in the terminal
//! bundle so a supervising layer can review what each agent decided
//! and with how much confidence.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::core::task::TaskId;
use crate::payload::{AgentPayload, Assumption};

/// One decision, as recorded for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub confidence: f64,
    pub reasoning: String,
    pub assumptions: Vec<Assumption>,
    pub alternatives: Vec<String>,
    /// Terminal outcome of the task, e.g. "success" or a failure kind.
    pub outcome: String,
    pub requires_human_review: bool,
}

impl DecisionRecord {
    /// Build a record from a produced payload and its outcome.
    pub fn from_payload(payload: &AgentPayload, outcome: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: payload.task_id.clone(),
            agent_id: payload.agent_id.clone(),
            confidence: payload.confidence,
            reasoning: if payload.reasoning_trace.is_empty() {
                "no reasoning provided".to_string()
            } else {
                payload.reasoning_trace.clone()
            },
            assumptions: payload.assumptions.clone(),
            alternatives: payload.alternatives.clone(),
            outcome: outcome.into(),
            requires_human_review: payload.metadata.requires_human_review,
        }
    }
}

/// Append-only decision log for one run.
#[derive(Default)]
pub struct DecisionLog {
    records: Mutex<Vec<DecisionRecord>>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: DecisionRecord) {
        self.records.lock().expect("decision log poisoned").push(record);
    }

    pub fn snapshot(&self) -> Vec<DecisionRecord> {
        self.records.lock().expect("decision log poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("decision log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
