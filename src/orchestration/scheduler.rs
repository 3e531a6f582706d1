//! Scheduler for level-driven task execution.
//!
//! The scheduler owns all task-state records for one submission and is
//! the only component that mutates them. It executes the DAG level by
//! level: within a level, serial-required tasks run one at a time in
//! insertion order and parallel-eligible tasks share a bounded fan-out;
//! between levels there is a strict barrier, so every task observes all
//! checkpoints sealed by earlier levels. On failure it drives the
//! rollback policy over the predecessor chain of sealed checkpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::core::dag::TaskDag;
use crate::core::task::{TaskId, TaskRecord, TaskState};
use crate::error::FailureKind;
use crate::orchestration::audit::{DecisionLog, DecisionRecord};
use crate::orchestration::events::{EventSink, GuardrailKind, OrchestratorEvent};
use crate::orchestration::pipeline::{ExecutionPipeline, PipelineRequest, TaskFailure};
use crate::orchestration::RunId;
use crate::payload::AgentPayload;
use crate::verifier::{CheckpointId, CheckpointVerdict, StateVerifier};

/// One guardrail firing, as collected into the terminal bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailActivation {
    pub kind: GuardrailKind,
    pub task_id: TaskId,
}

/// Outcome of walking the checkpoint chain after a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackVerdict {
    /// The task whose failure triggered the rollback.
    pub failed_task: TaskId,
    /// The most recent checkpoint that still verifies VALID.
    pub last_good: Option<CheckpointId>,
    /// Tasks whose produced work was discarded.
    pub rolled_back: Vec<TaskId>,
}

/// Aggregate confidence over successful tasks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfidenceStats {
    pub min: f64,
    pub mean: f64,
}

/// The terminal result bundle for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    /// Per-task records, including retry histories and final payloads.
    pub tasks: HashMap<TaskId, TaskRecord>,
    /// Surviving checkpoints in seal order.
    pub sealed_checkpoints: Vec<CheckpointId>,
    /// Tasks whose payloads were flagged for human review.
    pub human_review: Vec<TaskId>,
    /// Every guardrail that fired, in detection order.
    pub guardrails: Vec<GuardrailActivation>,
    /// Min and mean outgoing confidence over successful tasks.
    pub confidence: ConfidenceStats,
    /// Rollback verdict, when a failure forced one.
    pub rollback: Option<RollbackVerdict>,
    /// Decision audit trail for the run.
    pub decisions: Vec<DecisionRecord>,
    /// Whether the run was cancelled by the caller.
    pub cancelled: bool,
}

impl RunReport {
    /// Final state of one task.
    pub fn state_of(&self, id: &TaskId) -> Option<&TaskState> {
        self.tasks.get(id).map(|r| &r.state)
    }

    /// Whether every task ended in SUCCESS.
    pub fn all_succeeded(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(|r| r.state == TaskState::Success)
    }
}

/// Scheduler driving one submission to completion.
pub struct Scheduler {
    config: OrchestratorConfig,
    dag: TaskDag,
    pipeline: Arc<ExecutionPipeline>,
    verifier: Arc<StateVerifier>,
    audit: Arc<DecisionLog>,
    sink: EventSink,
    cancel: CancellationToken,
    run_id: RunId,
    initial_payloads: HashMap<TaskId, AgentPayload>,
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    /// (task, checkpoint) pairs in seal order, the scheduler's view of
    /// completion time.
    seal_order: Mutex<Vec<(TaskId, CheckpointId)>>,
    guardrails: Mutex<Vec<GuardrailActivation>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        dag: TaskDag,
        pipeline: Arc<ExecutionPipeline>,
        verifier: Arc<StateVerifier>,
        audit: Arc<DecisionLog>,
        sink: EventSink,
        cancel: CancellationToken,
        run_id: RunId,
        initial_payloads: HashMap<TaskId, AgentPayload>,
    ) -> Self {
        let records = dag
            .task_ids()
            .map(|id| {
                let mut record = TaskRecord::new(id.clone());
                record.chain_depth = dag.depth(id);
                (id.clone(), record)
            })
            .collect();

        Self {
            config,
            dag,
            pipeline,
            verifier,
            audit,
            sink,
            cancel,
            run_id,
            initial_payloads,
            records: RwLock::new(records),
            seal_order: Mutex::new(Vec::new()),
            guardrails: Mutex::new(Vec::new()),
        }
    }

    /// Non-blocking snapshot of task states.
    pub fn task_states(&self) -> HashMap<TaskId, TaskState> {
        let records = self.records.read().expect("records poisoned");
        records
            .iter()
            .map(|(id, r)| (id.clone(), r.state.clone()))
            .collect()
    }

    /// Drive the run to completion or irrecoverable failure.
    pub async fn run(self: Arc<Self>) -> RunReport {
        info!(run_id = %self.run_id, tasks = self.dag.task_count(), "run starting");
        let mut rollback: Option<RollbackVerdict> = None;

        'levels: for (level_index, level) in self.dag.levels().iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            debug!(run_id = %self.run_id, level = level_index, tasks = level.len(), "level starting");

            let (serial, parallel): (Vec<&TaskId>, Vec<&TaskId>) = level.iter().partition(|id| {
                self.dag
                    .node(id)
                    .map(|n| n.parallel_hint.is_serial())
                    .unwrap_or(false)
            });

            // Serial-required tasks, one at a time in insertion order.
            for task_id in serial {
                if self.cancel.is_cancelled() {
                    break 'levels;
                }
                if !self.eligible(task_id) {
                    continue;
                }
                if let Some(failure) = Self::execute_one(&self, task_id).await {
                    match Self::handle_terminal_failure(&self, task_id, failure).await {
                        FailureDisposition::Recovered => {}
                        FailureDisposition::Abort(verdict) => {
                            rollback = Some(verdict);
                            break 'levels;
                        }
                    }
                }
            }

            // Parallel-eligible tasks share the fan-out budget.
            let semaphore = Arc::new(Semaphore::new(self.config.fan_out_limit));
            let mut handles = Vec::new();
            for task_id in parallel {
                if !self.eligible(task_id) {
                    continue;
                }
                let this = Arc::clone(&self);
                let id = task_id.clone();
                let semaphore = Arc::clone(&semaphore);
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    let failure = Self::execute_one(&this, &id).await;
                    (id, failure)
                }));
            }

            let mut level_failures: Vec<(TaskId, TaskFailure)> = Vec::new();
            for joined in futures::future::join_all(handles).await {
                match joined {
                    Ok((id, Some(failure))) => level_failures.push((id, failure)),
                    Ok((_, None)) => {}
                    Err(e) => warn!(run_id = %self.run_id, error = %e, "task panicked"),
                }
            }

            // Failures are resolved in insertion order; the first one that
            // cannot be recovered aborts the run.
            level_failures
                .sort_by_key(|(id, _)| level.iter().position(|l| l == id).unwrap_or(usize::MAX));
            for (task_id, failure) in level_failures {
                match Self::handle_terminal_failure(&self, &task_id, failure).await {
                    FailureDisposition::Recovered => {}
                    FailureDisposition::Abort(verdict) => {
                        rollback = Some(verdict);
                        break 'levels;
                    }
                }
            }
        }

        self.report(rollback)
    }

    /// A task is eligible when it has not already reached a terminal
    /// state (rolled-back tasks are not re-executed automatically) and
    /// every upstream task is SUCCESS.
    fn eligible(&self, task_id: &TaskId) -> bool {
        let records = self.records.read().expect("records poisoned");
        let pending = records
            .get(task_id)
            .map(|r| !r.state.is_terminal())
            .unwrap_or(false);
        pending
            && self.dag.dependencies(task_id).iter().all(|dep| {
                records
                    .get(dep)
                    .map(|r| r.state == TaskState::Success)
                    .unwrap_or(false)
            })
    }

    /// Execute one task through the pipeline, updating its record.
    /// Returns the terminal failure, if any.
    async fn execute_one(this: &Arc<Self>, task_id: &TaskId) -> Option<TaskFailure> {
        let node = this.dag.node(task_id)?.clone();

        this.transition(task_id, TaskState::Ready);
        this.transition(task_id, TaskState::Running);

        let (inputs, upstream_low_streak, predecessor) = this.gather_inputs(task_id);

        let notify_target = Arc::clone(this);
        let notify_id = task_id.clone();
        let retry_notify: crate::orchestration::pipeline::RetryNotify =
            Arc::new(move |attempt: u32, kind: FailureKind, error: &str| {
                notify_target.record_retry(&notify_id, attempt, kind, error);
            });

        let request = PipelineRequest {
            chain_depth: this.dag.depth(task_id),
            node,
            inputs,
            upstream_low_streak,
            predecessor,
            cancel: this.cancel.clone(),
            retry_notify: Some(retry_notify),
        };

        match this.pipeline.execute(request).await {
            Ok(success) => {
                this.collect_guardrails(task_id, &success.guardrails);
                {
                    let mut records = this.records.write().expect("records poisoned");
                    if let Some(record) = records.get_mut(task_id) {
                        record.low_confidence_streak = success.low_confidence_streak;
                        record.retry_history = success.retry_history.clone();
                        record.succeed(success.payload, success.checkpoint_id.clone());
                    }
                }
                this.seal_order
                    .lock()
                    .expect("seal order poisoned")
                    .push((task_id.clone(), success.checkpoint_id));
                this.sink.emit(OrchestratorEvent::TaskStateChanged {
                    task_id: task_id.clone(),
                    state: TaskState::Success,
                });
                None
            }
            Err(failure) => {
                this.collect_guardrails(task_id, &failure.guardrails);
                {
                    let mut records = this.records.write().expect("records poisoned");
                    if let Some(record) = records.get_mut(task_id) {
                        record.retry_history = failure.retry_history.clone();
                        record.fail(failure.kind, &failure.error);
                    }
                }
                this.sink.emit(OrchestratorEvent::TaskStateChanged {
                    task_id: task_id.clone(),
                    state: TaskState::Failed {
                        kind: failure.kind,
                        error: failure.error.clone(),
                    },
                });
                Some(failure)
            }
        }
    }

    /// Upstream payloads (or the initial payload for roots), the largest
    /// upstream low-confidence streak, and the most recently sealed
    /// upstream checkpoint.
    fn gather_inputs(
        &self,
        task_id: &TaskId,
    ) -> (Vec<AgentPayload>, u32, Option<CheckpointId>) {
        let deps = self.dag.dependencies(task_id);
        if deps.is_empty() {
            let inputs = self
                .initial_payloads
                .get(task_id)
                .cloned()
                .map(|p| vec![p])
                .unwrap_or_default();
            return (inputs, 0, None);
        }

        let records = self.records.read().expect("records poisoned");
        let mut inputs = Vec::with_capacity(deps.len());
        let mut low_streak = 0;
        let mut predecessor: Option<(u64, CheckpointId)> = None;
        for dep in deps {
            if let Some(record) = records.get(dep) {
                if let Some(payload) = &record.payload {
                    inputs.push(payload.clone());
                }
                low_streak = low_streak.max(record.low_confidence_streak);
                if let Some(cp_id) = &record.checkpoint_id {
                    if let Some(cp) = self.verifier.get(cp_id) {
                        if predecessor.as_ref().map(|(seq, _)| cp.seq > *seq).unwrap_or(true) {
                            predecessor = Some((cp.seq, cp_id.clone()));
                        }
                    }
                }
            }
        }
        (inputs, low_streak, predecessor.map(|(_, id)| id))
    }

    fn record_retry(&self, task_id: &TaskId, attempt: u32, kind: FailureKind, error: &str) {
        {
            let mut records = self.records.write().expect("records poisoned");
            if let Some(record) = records.get_mut(task_id) {
                record.retrying(attempt, kind, error);
            }
        }
        self.sink.emit(OrchestratorEvent::TaskStateChanged {
            task_id: task_id.clone(),
            state: TaskState::Retrying { attempt },
        });
    }

    fn transition(&self, task_id: &TaskId, state: TaskState) {
        {
            let mut records = self.records.write().expect("records poisoned");
            if let Some(record) = records.get_mut(task_id) {
                record.state = state.clone();
            }
        }
        self.sink
            .emit(OrchestratorEvent::TaskStateChanged {
                task_id: task_id.clone(),
                state,
            });
    }

    fn collect_guardrails(&self, task_id: &TaskId, kinds: &[GuardrailKind]) {
        if kinds.is_empty() {
            return;
        }
        let mut guardrails = self.guardrails.lock().expect("guardrails poisoned");
        guardrails.extend(kinds.iter().map(|kind| GuardrailActivation {
            kind: *kind,
            task_id: task_id.clone(),
        }));
    }

    /// Rollback, then decide whether the run can continue.
    async fn handle_terminal_failure(
        this: &Arc<Self>,
        task_id: &TaskId,
        failure: TaskFailure,
    ) -> FailureDisposition {
        warn!(
            run_id = %this.run_id,
            task_id = %task_id,
            kind = %failure.kind,
            "task failed terminally, rolling back"
        );
        let verdict = this.rollback(task_id);

        let idempotent = this
            .dag
            .node(task_id)
            .map(|n| n.idempotent)
            .unwrap_or(false);
        if idempotent && !this.cancel.is_cancelled() {
            // One bounded re-run against the rolled-back state.
            info!(run_id = %this.run_id, task_id = %task_id, "re-running idempotent task after rollback");
            if Self::execute_one(this, task_id).await.is_none() {
                return FailureDisposition::Recovered;
            }
        }

        FailureDisposition::Abort(verdict)
    }

    /// Walk backward over the predecessor chain of sealed checkpoints,
    /// stop at the first VALID one, and discard everything sealed after
    /// it.
    fn rollback(&self, failed_task: &TaskId) -> RollbackVerdict {
        let seal_order = self.seal_order.lock().expect("seal order poisoned").clone();

        // Start from the most recently sealed upstream of the failed task;
        // with no sealed upstream there is nothing to keep.
        let (_, _, start) = self.gather_inputs(failed_task);
        let mut last_good: Option<CheckpointId> = None;
        let mut cursor = start.and_then(|id| self.verifier.get(&id));
        while let Some(checkpoint) = cursor {
            match self.verifier.verify_stored(&checkpoint.id) {
                CheckpointVerdict::Valid => {
                    last_good = Some(checkpoint.id.clone());
                    break;
                }
                verdict => {
                    debug!(
                        checkpoint_id = %checkpoint.id,
                        verdict = %verdict,
                        "checkpoint unusable during rollback, walking back"
                    );
                    cursor = checkpoint
                        .predecessor_hash
                        .as_deref()
                        .and_then(|h| self.verifier.find_by_state_hash(h));
                }
            }
        }

        let last_good_seq = last_good
            .as_ref()
            .and_then(|id| self.verifier.get(id))
            .map(|c| c.seq);

        let mut rolled_back = Vec::new();
        {
            let mut records = self.records.write().expect("records poisoned");
            for (task_id, checkpoint_id) in &seal_order {
                let seq = self.verifier.get(checkpoint_id).map(|c| c.seq);
                let beyond = match (seq, last_good_seq) {
                    (Some(seq), Some(last)) => seq > last,
                    (Some(_), None) => true,
                    (None, _) => true,
                };
                if beyond {
                    if let Some(record) = records.get_mut(task_id) {
                        record.roll_back();
                        rolled_back.push(task_id.clone());
                        self.sink.emit(OrchestratorEvent::TaskStateChanged {
                            task_id: task_id.clone(),
                            state: TaskState::RolledBack,
                        });
                    }
                }
            }
        }

        // Downstream tasks of the failure can no longer run against
        // trustworthy state; they are part of the rollback even when they
        // never produced anything.
        {
            let mut records = self.records.write().expect("records poisoned");
            for descendant in self.dag.descendants(failed_task) {
                if let Some(record) = records.get_mut(&descendant) {
                    if !record.state.is_terminal() {
                        record.roll_back();
                        rolled_back.push(descendant.clone());
                        self.sink.emit(OrchestratorEvent::TaskStateChanged {
                            task_id: descendant.clone(),
                            state: TaskState::RolledBack,
                        });
                    }
                }
            }
        }

        let verdict = RollbackVerdict {
            failed_task: failed_task.clone(),
            last_good: last_good.clone(),
            rolled_back: rolled_back.clone(),
        };
        self.sink.emit(OrchestratorEvent::RollbackDecision {
            failed_task: failed_task.clone(),
            last_good,
            rolled_back,
        });
        verdict
    }

    /// Assemble the terminal bundle.
    fn report(&self, rollback: Option<RollbackVerdict>) -> RunReport {
        let records = self.records.read().expect("records poisoned").clone();

        let sealed_checkpoints: Vec<CheckpointId> = {
            let seal_order = self.seal_order.lock().expect("seal order poisoned");
            seal_order
                .iter()
                .filter(|(task_id, _)| {
                    records
                        .get(task_id)
                        .map(|r| r.state == TaskState::Success)
                        .unwrap_or(false)
                })
                .map(|(_, cp)| cp.clone())
                .collect()
        };

        let mut human_review: Vec<TaskId> = records
            .values()
            .filter(|r| {
                r.payload
                    .as_ref()
                    .map(|p| p.metadata.requires_human_review)
                    .unwrap_or(false)
            })
            .map(|r| r.task_id.clone())
            .collect();
        human_review.sort();

        let confidences: Vec<f64> = records
            .values()
            .filter(|r| r.state == TaskState::Success)
            .filter_map(|r| r.payload.as_ref().map(|p| p.confidence))
            .collect();
        let confidence = if confidences.is_empty() {
            ConfidenceStats::default()
        } else {
            ConfidenceStats {
                min: confidences.iter().cloned().fold(f64::INFINITY, f64::min),
                mean: confidences.iter().sum::<f64>() / confidences.len() as f64,
            }
        };

        info!(
            run_id = %self.run_id,
            sealed = sealed_checkpoints.len(),
            rolled_back = rollback.as_ref().map(|r| r.rolled_back.len()).unwrap_or(0),
            "run finished"
        );

        RunReport {
            run_id: self.run_id,
            tasks: records,
            sealed_checkpoints,
            human_review,
            guardrails: self.guardrails.lock().expect("guardrails poisoned").clone(),
            confidence,
            rollback,
            decisions: self.audit.snapshot(),
            cancelled: self.cancel.is_cancelled(),
        }
    }
}

enum FailureDisposition {
    /// The idempotent re-run succeeded; the run continues.
    Recovered,
    /// The run ends with this rollback verdict.
    Abort(RollbackVerdict),
}
