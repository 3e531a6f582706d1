//! Agent identity, roles, the invocation contract, and the registry.
//!
//! An agent is an opaque computation behind the [`Agent`] trait. The core
//! never generates content itself: it hands an input payload set and a
//! deadline to the agent and verifies whatever comes back. Implementers
//! are free to wrap AI providers, HTTP clients, or in-process fakes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::TaskId;
use crate::payload::AgentPayload;

/// Caller-supplied opaque identifier for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role an agent plays in the pipeline.
///
/// Roles drive the pipeline's cross-check hooks: publisher tasks are
/// high-stakes by default, adversarial agents run the disagreement
/// review, validators blend confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Generator,
    Validator,
    Adversarial,
    Publisher,
    Worker,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Generator => write!(f, "generator"),
            AgentRole::Validator => write!(f, "validator"),
            AgentRole::Adversarial => write!(f, "adversarial"),
            AgentRole::Publisher => write!(f, "publisher"),
            AgentRole::Worker => write!(f, "worker"),
        }
    }
}

/// Errors an agent invocation may surface.
///
/// All variants are retryable from the pipeline's perspective; integrity
/// and schema problems are detected by the pipeline itself, not reported
/// by agents.
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("agent timed out")]
    Timeout,

    #[error("agent rate-limited")]
    RateLimited,

    #[error("transient agent failure: {0}")]
    Transient(String),
}

/// Input handed to an agent invocation.
#[derive(Debug, Clone)]
pub struct InvocationInput {
    /// Task being executed.
    pub task_id: TaskId,
    /// Upstream payloads, integrity-checked by the pipeline beforehand.
    pub inputs: Vec<AgentPayload>,
    /// Budget for this invocation; the pipeline also enforces it.
    pub deadline: Duration,
}

/// The invocation contract.
///
/// The returned payload must declare the upstream ids it consumed, carry
/// a body that validates against the task's output schema, and set an
/// explicit success indicator. Deviations are caught by the pipeline and
/// reported as typed failures, never silently accepted.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The role this agent fulfils.
    fn role(&self) -> AgentRole;

    /// Execute the task and produce a payload.
    async fn invoke(&self, input: InvocationInput) -> std::result::Result<AgentPayload, AgentError>;
}

/// Live statistics for a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub execution_count: u64,
    pub error_count: u64,
    pub mean_confidence: f64,
}

struct Registered {
    agent: Arc<dyn Agent>,
    role: AgentRole,
    execution_count: u64,
    error_count: u64,
    confidence_sum: f64,
}

/// Registry of agents known to the orchestrator.
///
/// Agents are registered before submission; a task node referencing an
/// unregistered id is rejected at submission time.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Registered>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under an id. Re-registering an id replaces the
    /// previous agent and resets its statistics.
    pub fn register(&self, id: AgentId, agent: Arc<dyn Agent>) {
        let role = agent.role();
        tracing::info!(agent_id = %id, role = %role, "registering agent");
        let mut agents = self.agents.write().expect("agent registry poisoned");
        agents.insert(
            id,
            Registered {
                agent,
                role,
                execution_count: 0,
                error_count: 0,
                confidence_sum: 0.0,
            },
        );
    }

    /// Look up an agent by id.
    pub fn get(&self, id: &AgentId) -> Option<Arc<dyn Agent>> {
        let agents = self.agents.read().expect("agent registry poisoned");
        agents.get(id).map(|r| Arc::clone(&r.agent))
    }

    /// Role of a registered agent.
    pub fn role_of(&self, id: &AgentId) -> Option<AgentRole> {
        let agents = self.agents.read().expect("agent registry poisoned");
        agents.get(id).map(|r| r.role)
    }

    /// Whether an id is registered.
    pub fn contains(&self, id: &AgentId) -> bool {
        let agents = self.agents.read().expect("agent registry poisoned");
        agents.contains_key(id)
    }

    /// Record the outcome of an invocation for statistics.
    pub fn record_outcome(&self, id: &AgentId, success: bool, confidence: Option<f64>) {
        let mut agents = self.agents.write().expect("agent registry poisoned");
        if let Some(entry) = agents.get_mut(id) {
            entry.execution_count += 1;
            if !success {
                entry.error_count += 1;
            }
            if let Some(c) = confidence {
                entry.confidence_sum += c;
            }
        }
    }

    /// Snapshot of per-agent statistics, sorted by id.
    pub fn stats(&self) -> Vec<AgentStats> {
        let agents = self.agents.read().expect("agent registry poisoned");
        let mut stats: Vec<AgentStats> = agents
            .iter()
            .map(|(id, r)| AgentStats {
                agent_id: id.clone(),
                role: r.role,
                execution_count: r.execution_count,
                error_count: r.error_count,
                mean_confidence: if r.execution_count > 0 {
                    r.confidence_sum / r.execution_count as f64
                } else {
                    0.0
                },
            })
            .collect();
        stats.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        stats
    }
}
