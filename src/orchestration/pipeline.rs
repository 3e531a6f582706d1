//! Agent execution pipeline.
//!
//! The pipeline wraps one task execution end to end: input integrity,
//! breaker admission, the invocation itself with retry and backoff,
//! output verification, confidence propagation, the cross-checks, and
//! finally sealing a checkpoint. Four of the five guardrails fire here;
//! the fifth (hallucinated dependencies) is mostly caught at submission,
//! with a second line of defense on produced payloads.

use std::sync::Arc;
use std::time::Duration;

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentError, AgentId, AgentRegistry, AgentRole, InvocationInput};
use crate::breaker::{Admission, BreakerRegistry};
use crate::config::{OrchestratorConfig, LOW_CONFIDENCE_BOUNDARY, RISK_CEILING};
use crate::core::task::{AttemptFailure, TaskNode};
use crate::error::FailureKind;
use crate::orchestration::audit::{DecisionLog, DecisionRecord};
use crate::orchestration::events::{EventSink, GuardrailKind, OrchestratorEvent};
use crate::payload::AgentPayload;
use crate::verifier::{CheckpointId, CheckpointVerdict, StateVerifier};

/// Scheduler-provided hook invoked between retry attempts, so task-state
/// transitions stay under the scheduler's control.
pub type RetryNotify = Arc<dyn Fn(u32, FailureKind, &str) + Send + Sync>;

/// Everything the pipeline needs to execute one task.
pub struct PipelineRequest {
    pub node: TaskNode,
    /// Upstream payloads (or the initial payload for a root task).
    pub inputs: Vec<AgentPayload>,
    /// Longest path from a root to this task.
    pub chain_depth: u32,
    /// Largest low-confidence streak among upstream tasks.
    pub upstream_low_streak: u32,
    /// Checkpoint of the most recently sealed upstream task.
    pub predecessor: Option<CheckpointId>,
    /// Global cancellation for the run.
    pub cancel: CancellationToken,
    /// Called when an attempt fails retryably and another will follow.
    pub retry_notify: Option<RetryNotify>,
}

/// Successful task execution.
#[derive(Debug, Clone)]
pub struct TaskSuccess {
    pub payload: AgentPayload,
    pub confidence: f64,
    pub checkpoint_id: CheckpointId,
    pub guardrails: Vec<GuardrailKind>,
    pub low_confidence_streak: u32,
    pub retry_history: Vec<AttemptFailure>,
}

/// Failed task execution, with everything the scheduler needs to decide
/// between retry, rollback, and reporting.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub error: String,
    pub guardrails: Vec<GuardrailKind>,
    pub retry_history: Vec<AttemptFailure>,
}

impl TaskFailure {
    fn new(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            error: error.into(),
            guardrails: Vec::new(),
            retry_history: Vec::new(),
        }
    }

    fn with_guardrail(mut self, guardrail: GuardrailKind) -> Self {
        self.guardrails.push(guardrail);
        self
    }
}

/// The execution engine for a single task.
pub struct ExecutionPipeline {
    config: OrchestratorConfig,
    agents: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    verifier: Arc<StateVerifier>,
    audit: Arc<DecisionLog>,
    sink: EventSink,
}

impl ExecutionPipeline {
    pub fn new(
        config: OrchestratorConfig,
        agents: Arc<AgentRegistry>,
        breakers: Arc<BreakerRegistry>,
        verifier: Arc<StateVerifier>,
        audit: Arc<DecisionLog>,
        sink: EventSink,
    ) -> Self {
        Self {
            config,
            agents,
            breakers,
            verifier,
            audit,
            sink,
        }
    }

    /// Execute one task through the full pipeline.
    pub async fn execute(&self, request: PipelineRequest) -> Result<TaskSuccess, TaskFailure> {
        let task_id = request.node.id.clone();
        debug!(task_id = %task_id, agent_id = %request.node.agent_id, "pipeline start");

        // Step 1: input integrity. Any tampered upstream payload fails the
        // task immediately, before the agent sees it.
        self.check_inputs(&request)?;

        // Steps 2–3: breaker admission and invoke with retry-and-backoff.
        let (mut payload, retry_history) = match self.invoke_with_retry(&request).await {
            Ok(invoked) => invoked,
            Err(failure) => {
                self.agents
                    .record_outcome(&request.node.agent_id, false, None);
                return Err(failure);
            }
        };

        // Step 4: output schema validation and the phantom-success check.
        self.check_output(&request, &payload)
            .map_err(|f| self.record_failure(&request, &payload, f))?;

        // Step 5: output integrity sealing. The declared hash must match a
        // recomputation over the body; a mismatch is tampering, not a bug
        // to paper over.
        if !payload.verify_integrity() {
            let failure = TaskFailure::new(
                FailureKind::IntegrityViolation,
                format!(
                    "produced payload hash {} does not match body (expected {})",
                    payload.content_hash,
                    payload.compute_hash()
                ),
            )
            .with_guardrail(GuardrailKind::Desync);
            return Err(self.record_failure(&request, &payload, failure));
        }

        // Step 6a: validator cross-check, blending reported confidence.
        let mut operation_confidence = payload.confidence;
        if let Some(validator_id) = &request.node.validator {
            if let Some(review) = self.invoke_support(validator_id, &request, &payload).await {
                operation_confidence = 0.7 * operation_confidence + 0.3 * review.confidence;
                payload.metadata.extra.insert(
                    "validation".to_string(),
                    json!({
                        "validator_id": review.agent_id,
                        "confidence": review.confidence,
                    }),
                );
            }
        }

        // Step 6: confidence propagation with depth decay.
        let input_confidence = request
            .inputs
            .iter()
            .map(|p| p.confidence)
            .fold(1.0_f64, f64::min);
        let decay = self.config.depth_decay.powi(request.chain_depth as i32);
        let outgoing = (input_confidence * operation_confidence * decay).max(0.0);
        payload.confidence = outgoing;

        let low_streak = if outgoing < LOW_CONFIDENCE_BOUNDARY {
            request.upstream_low_streak + 1
        } else {
            0
        };

        if outgoing < self.config.confidence_floor {
            let failure = TaskFailure::new(
                FailureKind::ConfidenceCollapse,
                format!(
                    "outgoing confidence {:.3} below floor {:.2}",
                    outgoing, self.config.confidence_floor
                ),
            )
            .with_guardrail(GuardrailKind::ConfidenceCollapse);
            self.emit_guardrail(
                GuardrailKind::ConfidenceCollapse,
                Some(&task_id),
                &failure.error,
            );
            return Err(self.record_failure(&request, &payload, failure));
        }
        if low_streak > self.config.chain_depth_cap {
            let failure = TaskFailure::new(
                FailureKind::ConfidenceCollapse,
                format!(
                    "{} chained low-confidence steps exceed cap {}",
                    low_streak, self.config.chain_depth_cap
                ),
            )
            .with_guardrail(GuardrailKind::ConfidenceCollapse);
            self.emit_guardrail(
                GuardrailKind::ConfidenceCollapse,
                Some(&task_id),
                &failure.error,
            );
            return Err(self.record_failure(&request, &payload, failure));
        }

        // Step 7: adversarial cross-check for high-stakes tasks.
        let mut guardrails = Vec::new();
        if self.is_high_stakes(&request.node) {
            if let Some(adversary_id) = &request.node.adversary {
                match self.invoke_support(adversary_id, &request, &payload).await {
                    Some(review) => {
                        if let Err(failure) =
                            self.adversarial_check(&request, &mut payload, &review, &mut guardrails)
                        {
                            return Err(self.record_failure(&request, &payload, failure));
                        }
                    }
                    None => {
                        // Cannot independently verify a high-stakes result.
                        warn!(task_id = %task_id, "adversary unavailable, flagging for human review");
                        payload.metadata.requires_human_review = true;
                    }
                }
            }
        }

        // Step 8: seal the checkpoint, refreshing an expired predecessor
        // first (the desynchronization guardrail).
        let checkpoint_id = self.seal_checkpoint(&request, &payload, &mut guardrails)?;

        self.audit
            .append(DecisionRecord::from_payload(&payload, "success"));
        self.sink.emit(OrchestratorEvent::DecisionLogged {
            task_id: task_id.clone(),
            agent_id: payload.agent_id.clone(),
            confidence: payload.confidence,
        });
        self.agents
            .record_outcome(&request.node.agent_id, true, Some(outgoing));

        debug!(task_id = %task_id, confidence = outgoing, "pipeline complete");
        Ok(TaskSuccess {
            payload,
            confidence: outgoing,
            checkpoint_id,
            guardrails,
            low_confidence_streak: low_streak,
            retry_history,
        })
    }

    // ------------------------------------------------------------------
    // Step 1: input integrity
    // ------------------------------------------------------------------

    fn check_inputs(&self, request: &PipelineRequest) -> Result<(), TaskFailure> {
        for input in &request.inputs {
            if !input.verify_integrity() {
                let error = format!(
                    "input payload from task {} failed integrity: stored {} recomputed {}",
                    input.task_id,
                    input.content_hash,
                    input.compute_hash()
                );
                self.emit_guardrail(GuardrailKind::Desync, Some(&request.node.id), &error);
                return Err(TaskFailure::new(FailureKind::IntegrityViolation, error)
                    .with_guardrail(GuardrailKind::Desync));
            }
            if !input.confidence_in_range() {
                return Err(TaskFailure::new(
                    FailureKind::SchemaViolation,
                    format!(
                        "input payload from task {} carries confidence {} outside [0, 1]",
                        input.task_id, input.confidence
                    ),
                ));
            }
        }

        if let Some(schema) = &request.node.input_schema {
            for input in &request.inputs {
                self.validate_schema(schema, &input.body, "input")?;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps 2–3: breaker admission, invoke with retry-and-backoff
    // ------------------------------------------------------------------

    async fn invoke_with_retry(
        &self,
        request: &PipelineRequest,
    ) -> Result<(AgentPayload, Vec<AttemptFailure>), TaskFailure> {
        let node = &request.node;
        let agent = self.agents.get(&node.agent_id).ok_or_else(|| {
            TaskFailure::new(
                FailureKind::SchemaViolation,
                format!("agent {} disappeared from the registry", node.agent_id),
            )
        })?;
        let breaker = self.breakers.breaker(&node.agent_id);

        let mut history: Vec<AttemptFailure> = Vec::new();
        let mut attempt: u32 = 0;
        loop {
            if request.cancel.is_cancelled() {
                return Err(self.fail_attempt(
                    request,
                    history,
                    FailureKind::AgentTransient,
                    "run cancelled before invocation".to_string(),
                ));
            }

            // Step 2: admission. Open rejects outright; a contended
            // half-open slot is retryable like any transient condition.
            let (admission, transition) = breaker.admit();
            if let Some(t) = transition {
                self.sink.emit(OrchestratorEvent::BreakerTransition {
                    agent_id: node.agent_id.clone(),
                    from: t.from,
                    to: t.to,
                });
            }
            let probe = match admission {
                Admission::Admitted { probe } => probe,
                Admission::RejectedOpen => {
                    return Err(self.fail_attempt(
                        request,
                        history,
                        FailureKind::BreakerOpen,
                        format!("breaker open for agent {}", node.agent_id),
                    ));
                }
                Admission::RejectedHalfOpen => {
                    let error = format!(
                        "breaker half-open for agent {}, probe slot taken",
                        node.agent_id
                    );
                    let backoff = self.register_retry(
                        request,
                        &mut history,
                        &mut attempt,
                        FailureKind::BreakerHalfOpenReject,
                        &error,
                    )?;
                    self.backoff_sleep(request, backoff).await;
                    continue;
                }
            };

            // Step 3: the invocation, bounded by the task deadline and the
            // global cancellation token. This is the only blocking point.
            let input = InvocationInput {
                task_id: node.id.clone(),
                inputs: request.inputs.clone(),
                deadline: node.timeout,
            };
            let outcome = tokio::select! {
                _ = request.cancel.cancelled() => None,
                result = tokio::time::timeout(node.timeout, agent.invoke(input)) => Some(result),
            };

            let (kind, error) = match outcome {
                None => {
                    breaker.record_failure(probe);
                    return Err(self.fail_attempt(
                        request,
                        history,
                        FailureKind::AgentTransient,
                        "run cancelled during invocation".to_string(),
                    ));
                }
                Some(Err(_)) => {
                    if let Some(t) = breaker.record_failure(probe) {
                        self.sink.emit(OrchestratorEvent::BreakerTransition {
                            agent_id: node.agent_id.clone(),
                            from: t.from,
                            to: t.to,
                        });
                    }
                    (
                        FailureKind::AgentTimeout,
                        format!("agent exceeded deadline of {:?}", node.timeout),
                    )
                }
                Some(Ok(Ok(payload))) => {
                    if let Some(t) = breaker.record_success(probe) {
                        self.sink.emit(OrchestratorEvent::BreakerTransition {
                            agent_id: node.agent_id.clone(),
                            from: t.from,
                            to: t.to,
                        });
                    }
                    return Ok((payload, history));
                }
                Some(Ok(Err(agent_error))) => {
                    if let Some(t) = breaker.record_failure(probe) {
                        self.sink.emit(OrchestratorEvent::BreakerTransition {
                            agent_id: node.agent_id.clone(),
                            from: t.from,
                            to: t.to,
                        });
                    }
                    let kind = match agent_error {
                        AgentError::Timeout => FailureKind::AgentTimeout,
                        AgentError::RateLimited | AgentError::Transient(_) => {
                            FailureKind::AgentTransient
                        }
                    };
                    (kind, agent_error.to_string())
                }
            };

            let backoff = self.register_retry(request, &mut history, &mut attempt, kind, &error)?;
            self.backoff_sleep(request, backoff).await;
        }
    }

    /// Record a retryable attempt failure, returning the backoff to wait
    /// before the next attempt, or the terminal failure once the budget
    /// is spent.
    fn register_retry(
        &self,
        request: &PipelineRequest,
        history: &mut Vec<AttemptFailure>,
        attempt: &mut u32,
        kind: FailureKind,
        error: &str,
    ) -> Result<Duration, TaskFailure> {
        history.push(AttemptFailure {
            attempt: *attempt,
            kind,
            error: error.to_string(),
            at: chrono::Utc::now(),
        });

        if *attempt >= request.node.max_retries {
            return Err(TaskFailure {
                kind,
                error: format!(
                    "{} (retries exhausted after {} attempts)",
                    error,
                    *attempt + 1
                ),
                guardrails: Vec::new(),
                retry_history: std::mem::take(history),
            });
        }

        let backoff = self.config.backoff_for_attempt(*attempt as usize);
        *attempt += 1;
        debug!(
            task_id = %request.node.id,
            attempt = *attempt,
            kind = %kind,
            backoff = ?backoff,
            "retrying after backoff"
        );
        if let Some(notify) = &request.retry_notify {
            notify(*attempt, kind, error);
        }
        Ok(backoff)
    }

    async fn backoff_sleep(&self, request: &PipelineRequest, backoff: Duration) {
        tokio::select! {
            _ = request.cancel.cancelled() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    fn fail_attempt(
        &self,
        _request: &PipelineRequest,
        history: Vec<AttemptFailure>,
        kind: FailureKind,
        error: String,
    ) -> TaskFailure {
        TaskFailure {
            kind,
            error,
            guardrails: Vec::new(),
            retry_history: history,
        }
    }

    // ------------------------------------------------------------------
    // Step 4: output validation
    // ------------------------------------------------------------------

    fn check_output(
        &self,
        request: &PipelineRequest,
        payload: &AgentPayload,
    ) -> Result<(), TaskFailure> {
        let node = &request.node;

        // Phantom success: the indicator must be explicitly true.
        match payload.metadata.success {
            Some(true) => {}
            other => {
                let error = match other {
                    Some(false) => "agent declared success=false".to_string(),
                    _ => "agent omitted the success indicator".to_string(),
                };
                self.emit_guardrail(GuardrailKind::PhantomSuccess, Some(&node.id), &error);
                return Err(TaskFailure::new(FailureKind::ToolPhantomSuccess, error)
                    .with_guardrail(GuardrailKind::PhantomSuccess));
            }
        }

        if !payload.confidence_in_range() {
            return Err(TaskFailure::new(
                FailureKind::SchemaViolation,
                format!(
                    "reported confidence {} outside [0, 1]",
                    payload.confidence
                ),
            ));
        }

        // Declared consumption must stay within the node's declared
        // upstream ids; anything else is a hallucinated dependency.
        for consumed in &payload.consumed {
            if !node.dependencies.contains(consumed) {
                let error = format!(
                    "payload claims to consume {}, which is not an upstream of {}",
                    consumed, node.id
                );
                self.emit_guardrail(
                    GuardrailKind::HallucinatedDependency,
                    Some(&node.id),
                    &error,
                );
                return Err(TaskFailure::new(FailureKind::HallucinatedDependency, error)
                    .with_guardrail(GuardrailKind::HallucinatedDependency));
            }
        }

        if let Some(schema) = &node.output_schema {
            self.validate_schema(schema, &payload.body, "output")?;
        }

        Ok(())
    }

    fn validate_schema(
        &self,
        schema: &Value,
        body: &Value,
        direction: &str,
    ) -> Result<(), TaskFailure> {
        let compiled = JSONSchema::compile(schema).map_err(|e| {
            TaskFailure::new(
                FailureKind::SchemaViolation,
                format!("{} schema failed to compile: {}", direction, e),
            )
        })?;
        if let Err(errors) = compiled.validate(body) {
            let details: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(TaskFailure::new(
                FailureKind::SchemaViolation,
                format!("{} schema violation: {}", direction, details.join("; ")),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps 6a/7: cross-check invocations
    // ------------------------------------------------------------------

    fn is_high_stakes(&self, node: &TaskNode) -> bool {
        node.high_stakes || self.agents.role_of(&node.agent_id) == Some(AgentRole::Publisher)
    }

    /// Invoke a validator or adversary with the primary payload as its
    /// only input. Support agents go through the breaker like anyone
    /// else; their failures never fail the primary task directly.
    async fn invoke_support(
        &self,
        agent_id: &AgentId,
        request: &PipelineRequest,
        primary: &AgentPayload,
    ) -> Option<AgentPayload> {
        let agent = self.agents.get(agent_id)?;
        let breaker = self.breakers.breaker(agent_id);
        let (admission, _) = breaker.admit();
        let probe = match admission {
            Admission::Admitted { probe } => probe,
            _ => {
                debug!(agent_id = %agent_id, "support agent gated by breaker");
                return None;
            }
        };

        let input = InvocationInput {
            task_id: request.node.id.clone(),
            inputs: vec![primary.clone()],
            deadline: request.node.timeout,
        };
        match tokio::time::timeout(request.node.timeout, agent.invoke(input)).await {
            Ok(Ok(payload)) => {
                breaker.record_success(probe);
                self.agents.record_outcome(agent_id, true, Some(payload.confidence));
                Some(payload)
            }
            Ok(Err(e)) => {
                breaker.record_failure(probe);
                self.agents.record_outcome(agent_id, false, None);
                warn!(agent_id = %agent_id, error = %e, "support agent failed");
                None
            }
            Err(_) => {
                breaker.record_failure(probe);
                self.agents.record_outcome(agent_id, false, None);
                warn!(agent_id = %agent_id, "support agent timed out");
                None
            }
        }
    }

    /// Step 7 proper: score the disagreement, flag or fail.
    fn adversarial_check(
        &self,
        request: &PipelineRequest,
        payload: &mut AgentPayload,
        review: &AgentPayload,
        guardrails: &mut Vec<GuardrailKind>,
    ) -> Result<(), TaskFailure> {
        let task_id = &request.node.id;
        let disagreement = disagreement_score(&payload.body, &review.body);

        payload.metadata.extra.insert(
            "adversarial_review".to_string(),
            json!({
                "adversary_id": &review.agent_id,
                "disagreement_score": disagreement,
                "risks": review.body.get("risks").cloned().unwrap_or(Value::Null),
            }),
        );

        if disagreement > self.config.sycophancy_threshold {
            payload.metadata.requires_human_review = true;
            let detail = format!(
                "adversarial disagreement {:.2} exceeds threshold {:.2}; flagged for human review",
                disagreement, self.config.sycophancy_threshold
            );
            warn!(task_id = %task_id, disagreement, "adversary disagrees, flagging human review");
            self.emit_guardrail(GuardrailKind::Sycophancy, Some(task_id), &detail);
            guardrails.push(GuardrailKind::Sycophancy);
            return Ok(());
        }

        // Agreement is only trustworthy when the adversary actually did
        // independent work. An empty reasoning trace is a rubber stamp.
        if review.reasoning_trace.trim().is_empty() {
            let error = format!(
                "adversary {} agreed (score {:.2}) without an independent reasoning trace",
                review.agent_id, disagreement
            );
            self.emit_guardrail(GuardrailKind::Sycophancy, Some(task_id), &error);
            return Err(TaskFailure::new(FailureKind::SycophancySuspected, error)
                .with_guardrail(GuardrailKind::Sycophancy));
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Step 8: checkpoint sealing
    // ------------------------------------------------------------------

    fn seal_checkpoint(
        &self,
        request: &PipelineRequest,
        payload: &AgentPayload,
        guardrails: &mut Vec<GuardrailKind>,
    ) -> Result<CheckpointId, TaskFailure> {
        // Forced refresh: an expired predecessor must be re-sealed before
        // we chain on top of it. A mismatched one is a corruption event
        // and escalates to rollback instead.
        if let Some(pred) = &request.predecessor {
            match self.verifier.verify_stored(pred) {
                CheckpointVerdict::Expired => {
                    let detail = format!("predecessor checkpoint {} expired, re-sealing", pred);
                    self.emit_guardrail(GuardrailKind::Desync, Some(&request.node.id), &detail);
                    guardrails.push(GuardrailKind::Desync);
                    self.verifier
                        .reseal(pred, self.config.default_ttl)
                        .map_err(|e| {
                            TaskFailure::new(FailureKind::CheckpointExpired, e.to_string())
                        })?;
                }
                CheckpointVerdict::HashMismatch => {
                    return Err(TaskFailure::new(
                        FailureKind::CheckpointMismatch,
                        format!("predecessor checkpoint {} failed hash verification", pred),
                    )
                    .with_guardrail(GuardrailKind::Desync));
                }
                CheckpointVerdict::Valid | CheckpointVerdict::NotFound => {}
            }
        }

        let checkpoint_id = CheckpointId::from(request.node.id.as_str());
        // The snapshot is built from the payload's deterministic fields
        // only. Timestamps would make identical runs seal different
        // hashes, breaking reproducibility.
        let snapshot = json!({
            "task_id": &payload.task_id,
            "agent_id": &payload.agent_id,
            "body": &payload.body,
            "content_hash": &payload.content_hash,
            "confidence": payload.confidence,
        });
        let checkpoint = self
            .verifier
            .create_checkpoint(
                checkpoint_id.clone(),
                snapshot,
                self.config.default_ttl,
                request.predecessor.as_ref(),
            )
            .map_err(|e| TaskFailure::new(FailureKind::CheckpointMismatch, e.to_string()))?;

        self.sink.emit(OrchestratorEvent::CheckpointSealed {
            task_id: request.node.id.clone(),
            checkpoint_id: checkpoint_id.clone(),
            state_hash: checkpoint.state_hash,
        });
        Ok(checkpoint_id)
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn emit_guardrail(&self, kind: GuardrailKind, task_id: Option<&crate::core::task::TaskId>, detail: &str) {
        self.sink.emit(OrchestratorEvent::GuardrailTriggered {
            kind,
            task_id: task_id.cloned(),
            detail: detail.to_string(),
        });
    }

    /// Append the audit record for a failed pipeline and update stats.
    fn record_failure(
        &self,
        request: &PipelineRequest,
        payload: &AgentPayload,
        failure: TaskFailure,
    ) -> TaskFailure {
        self.audit.append(DecisionRecord::from_payload(
            payload,
            failure.kind.to_string(),
        ));
        self.agents
            .record_outcome(&request.node.agent_id, false, None);
        failure
    }
}

/// Disagreement between a primary body and an adversarial review body.
///
/// One minus the cosine overlap of token frequency vectors, blended
/// equally with the adversary's flagged risk count normalized by a
/// ceiling. Identical bodies with no risks score 0.0; disjoint bodies
/// with five or more risks score 1.0.
pub fn disagreement_score(primary: &Value, review: &Value) -> f64 {
    let overlap = cosine_overlap(
        &crate::hash::canonical_json(primary),
        &crate::hash::canonical_json(review),
    );
    let risk_count = review
        .get("risks")
        .and_then(Value::as_array)
        .map(|r| r.len())
        .unwrap_or(0) as f64;
    let risk_component = (risk_count / RISK_CEILING).min(1.0);
    (0.5 * (1.0 - overlap) + 0.5 * risk_component).clamp(0.0, 1.0)
}

fn cosine_overlap(a: &str, b: &str) -> f64 {
    let freq_a = token_frequencies(a);
    let freq_b = token_frequencies(b);
    if freq_a.is_empty() || freq_b.is_empty() {
        return if freq_a.is_empty() && freq_b.is_empty() {
            1.0
        } else {
            0.0
        };
    }

    let dot: f64 = freq_a
        .iter()
        .filter_map(|(token, count)| freq_b.get(token).map(|other| (*count * *other) as f64))
        .sum();
    let norm_a: f64 = freq_a.values().map(|c| (*c * *c) as f64).sum::<f64>().sqrt();
    let norm_b: f64 = freq_b.values().map(|c| (*c * *c) as f64).sum::<f64>().sqrt();
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

fn token_frequencies(text: &str) -> std::collections::HashMap<String, u32> {
    let mut freq = std::collections::HashMap::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        *freq.entry(token.to_lowercase()).or_insert(0) += 1;
    }
    freq
}
