//! Multi-agent DAG orchestration with integrity verification.
//!
//! `tandem` executes a directed acyclic graph of content-production
//! tasks across heterogeneous agents under integrity, confidence, and
//! failure-mode constraints. The scheduler levels the DAG and dispatches
//! tasks to the execution pipeline; the pipeline gates every invocation
//! behind a per-agent circuit breaker, verifies payloads for tampering,
//! propagates confidence along the chain, and cross-checks high-stakes
//! results with an adversarial review; the state verifier binds every
//! task boundary to a hash-chained, Merkle-rooted checkpoint that
//! rollback can return to.

pub mod agent;
pub mod breaker;
pub mod config;
pub mod core;
pub mod error;
pub mod hash;
pub mod merkle;
pub mod orchestration;
pub mod payload;
pub mod verifier;

pub use agent::{Agent, AgentError, AgentId, AgentRegistry, AgentRole, InvocationInput};
pub use breaker::{BreakerRegistry, BreakerStats, CircuitState};
pub use config::OrchestratorConfig;
pub use crate::core::dag::TaskDag;
pub use crate::core::task::{ParallelHint, TaskId, TaskNode, TaskRecord, TaskState};
pub use error::{Error, FailureKind, Result};
pub use orchestration::{
    EventEnvelope, GuardrailKind, Orchestrator, OrchestratorEvent, RollbackVerdict, RunHandle,
    RunId, RunReport, RunSnapshot,
};
pub use payload::{AgentPayload, ConfidenceLevel, PayloadMetadata};
pub use verifier::{Checkpoint, CheckpointId, CheckpointVerdict, StateVerifier};
