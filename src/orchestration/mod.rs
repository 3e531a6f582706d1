//! Orchestration layer: the pipeline, the scheduler, and the caller
//! surface.
//!
//! The [`Orchestrator`] is the library's front door. Callers register
//! agents, submit a set of task nodes with initial payloads, and drive
//! the run to completion. Observability events flow to an optional
//! caller-provided channel.

pub mod audit;
pub mod events;
pub mod pipeline;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{Agent, AgentId, AgentRegistry, AgentStats};
use crate::breaker::{BreakerConfig, BreakerRegistry, BreakerStats};
use crate::config::OrchestratorConfig;
use crate::core::dag::TaskDag;
use crate::core::task::{TaskId, TaskNode, TaskState};
use crate::error::{Error, FailureKind, Result};
use crate::payload::AgentPayload;
use crate::verifier::StateVerifier;

pub use audit::{DecisionLog, DecisionRecord};
pub use events::{EventEnvelope, EventSink, GuardrailKind, OrchestratorEvent};
pub use pipeline::{disagreement_score, ExecutionPipeline, PipelineRequest, TaskFailure, TaskSuccess};
pub use scheduler::{
    ConfidenceStats, GuardrailActivation, RollbackVerdict, RunReport, Scheduler,
};

/// Unique identifier for a run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a submitted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunHandle {
    pub run_id: RunId,
}

/// Non-blocking snapshot of a run for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub task_states: HashMap<TaskId, TaskState>,
    pub breakers: Vec<BreakerStats>,
    pub agents: Vec<AgentStats>,
    pub events_emitted: u64,
}

struct RunEntry {
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    sink: EventSink,
    consumed: bool,
}

/// The orchestration core.
///
/// Owns the agent registry, the process-wide breaker registry, and the
/// checkpoint verifier. Each submission gets its own scheduler and
/// decision log; the shared components persist across runs and are
/// dropped with the orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    agents: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    verifier: Arc<StateVerifier>,
    event_tx: Option<mpsc::UnboundedSender<EventEnvelope>>,
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::from(&config)));
        let verifier = Arc::new(StateVerifier::new(config.max_checkpoints));
        Self {
            config,
            agents: Arc::new(AgentRegistry::new()),
            breakers,
            verifier,
            event_tx: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a caller-provided event channel. Applies to runs submitted
    /// after the call.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Register an agent under an id.
    pub fn register_agent(&self, id: impl Into<AgentId>, agent: Arc<dyn Agent>) {
        self.agents.register(id.into(), agent);
    }

    /// The checkpoint verifier, for audits beyond the run surface.
    pub fn verifier(&self) -> &Arc<StateVerifier> {
        &self.verifier
    }

    /// Validate a submission and prepare a run.
    ///
    /// Rejects duplicate ids, hallucinated dependencies, cycles,
    /// unregistered agents, and schemas that fail to compile, all
    /// before anything executes.
    pub fn submit(
        &self,
        nodes: Vec<TaskNode>,
        initial_payloads: HashMap<TaskId, AgentPayload>,
    ) -> Result<RunHandle> {
        self.submit_with_config(nodes, initial_payloads, self.config.clone())
    }

    /// Like [`Orchestrator::submit`], with per-run option overrides
    /// (fan-out, TTL, backoff, thresholds). Breaker thresholds stay
    /// process-wide: breakers outlive individual runs.
    pub fn submit_with_config(
        &self,
        nodes: Vec<TaskNode>,
        initial_payloads: HashMap<TaskId, AgentPayload>,
        config: OrchestratorConfig,
    ) -> Result<RunHandle> {
        self.validate_agents(&nodes)?;
        self.validate_schemas(&nodes)?;
        let dag = TaskDag::build(nodes)?;

        let run_id = RunId::new();
        let cancel = CancellationToken::new();
        let sink = match &self.event_tx {
            Some(tx) => EventSink::new(run_id, tx.clone()),
            None => EventSink::disabled(run_id),
        };
        let audit = Arc::new(DecisionLog::new());
        let pipeline = Arc::new(ExecutionPipeline::new(
            config.clone(),
            Arc::clone(&self.agents),
            Arc::clone(&self.breakers),
            Arc::clone(&self.verifier),
            Arc::clone(&audit),
            sink.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config,
            dag,
            pipeline,
            Arc::clone(&self.verifier),
            audit,
            sink.clone(),
            cancel.clone(),
            run_id,
            initial_payloads,
        ));

        let mut runs = self.runs.lock().expect("runs poisoned");
        runs.insert(
            run_id,
            RunEntry {
                scheduler,
                cancel,
                sink,
                consumed: false,
            },
        );
        Ok(RunHandle { run_id })
    }

    /// Synchronously drive a run to completion and return the terminal
    /// bundle. A handle can be driven once.
    pub async fn run(&self, handle: &RunHandle) -> Result<RunReport> {
        let scheduler = {
            let mut runs = self.runs.lock().expect("runs poisoned");
            let entry = runs
                .get_mut(&handle.run_id)
                .ok_or(Error::RunNotFound(handle.run_id.0))?;
            if entry.consumed {
                return Err(Error::RunConsumed(handle.run_id.0));
            }
            entry.consumed = true;
            Arc::clone(&entry.scheduler)
        };
        Ok(scheduler.run().await)
    }

    /// Signal global cancellation: in-flight tasks abort, sealed
    /// checkpoints are preserved for rollback.
    pub fn cancel(&self, handle: &RunHandle) -> Result<()> {
        let runs = self.runs.lock().expect("runs poisoned");
        let entry = runs
            .get(&handle.run_id)
            .ok_or(Error::RunNotFound(handle.run_id.0))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Non-blocking snapshot of task states, breaker states, and agent
    /// statistics.
    pub fn inspect(&self, handle: &RunHandle) -> Result<RunSnapshot> {
        let runs = self.runs.lock().expect("runs poisoned");
        let entry = runs
            .get(&handle.run_id)
            .ok_or(Error::RunNotFound(handle.run_id.0))?;
        Ok(RunSnapshot {
            run_id: handle.run_id,
            task_states: entry.scheduler.task_states(),
            breakers: self.breakers.stats(),
            agents: self.agents.stats(),
            events_emitted: entry.sink.emitted(),
        })
    }

    fn validate_agents(&self, nodes: &[TaskNode]) -> Result<()> {
        for node in nodes {
            let mut required = vec![&node.agent_id];
            required.extend(node.validator.iter());
            required.extend(node.adversary.iter());
            for agent_id in required {
                if !self.agents.contains(agent_id) {
                    return Err(Error::Submission {
                        kind: FailureKind::UnknownAgent,
                        message: format!(
                            "task {} references unregistered agent {}",
                            node.id, agent_id
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_schemas(&self, nodes: &[TaskNode]) -> Result<()> {
        for node in nodes {
            for (schema, direction) in [
                (node.input_schema.as_ref(), "input"),
                (node.output_schema.as_ref(), "output"),
            ] {
                if let Some(schema) = schema {
                    if let Err(e) = jsonschema::JSONSchema::compile(schema) {
                        return Err(Error::Submission {
                            kind: FailureKind::SchemaRejected,
                            message: format!(
                                "task {} {} schema failed to compile: {}",
                                node.id, direction, e
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
