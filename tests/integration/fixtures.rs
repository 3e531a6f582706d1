//! Test fixtures for integration tests.
//!
//! Provides a scripted fake agent whose behavior (confidence, failures,
//! tampering, sycophancy) is configured per test, plus a fast config
//! that shrinks every time-based default to keep the suite quick.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tandem::{
    Agent, AgentError, AgentId, AgentPayload, AgentRole, InvocationInput, OrchestratorConfig,
    TaskId,
};

/// A fake agent with scripted behavior.
pub struct ScriptedAgent {
    name: AgentId,
    role: AgentRole,
    body: Value,
    op_confidence: f64,
    reasoning: String,
    success: Option<bool>,
    fail_first: u32,
    phantom_first: bool,
    tamper_hash: bool,
    echo_primary: bool,
    risks: Vec<String>,
    extra_consumed: Vec<TaskId>,
    sleep_for: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedAgent {
    pub fn new(name: &str, role: AgentRole) -> Self {
        Self {
            name: AgentId::from(name),
            role,
            body: json!({"text": format!("output from {}", name)}),
            op_confidence: 0.95,
            reasoning: format!("{} worked through the inputs", name),
            success: Some(true),
            fail_first: 0,
            phantom_first: false,
            tamper_hash: false,
            echo_primary: false,
            risks: Vec::new(),
            extra_consumed: Vec::new(),
            sleep_for: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn confidence(mut self, op_confidence: f64) -> Self {
        self.op_confidence = op_confidence;
        self
    }

    /// Produce an empty reasoning trace (the rubber-stamp adversary).
    pub fn no_reasoning(mut self) -> Self {
        self.reasoning = String::new();
        self
    }

    /// Fail the first `n` invocations with a transient error.
    pub fn fail_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Omit the success indicator on the first invocation only.
    pub fn phantom_first(mut self) -> Self {
        self.phantom_first = true;
        self
    }

    /// Always report the given success indicator.
    pub fn success(mut self, success: Option<bool>) -> Self {
        self.success = success;
        self
    }

    /// Return payloads whose hash does not match the body.
    pub fn tampered(mut self) -> Self {
        self.tamper_hash = true;
        self
    }

    /// Echo the primary payload's body (an agreeing adversary).
    pub fn echoing(mut self) -> Self {
        self.echo_primary = true;
        self
    }

    /// Flag these risks in the produced body.
    pub fn risks(mut self, risks: &[&str]) -> Self {
        self.risks = risks.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Claim to have consumed an upstream that was never declared.
    pub fn claims_consumed(mut self, task_id: &str) -> Self {
        self.extra_consumed.push(TaskId::from(task_id));
        self
    }

    /// Sleep before answering, to exercise timeouts and TTLs.
    pub fn sleeping(mut self, duration: Duration) -> Self {
        self.sleep_for = Some(duration);
        self
    }

    /// How many times this agent has been invoked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn invoke(
        &self,
        input: InvocationInput,
    ) -> std::result::Result<AgentPayload, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(duration) = self.sleep_for {
            tokio::time::sleep(duration).await;
        }
        if call < self.fail_first {
            return Err(AgentError::Transient(format!(
                "scripted failure {} of {}",
                call + 1,
                self.fail_first
            )));
        }

        let mut body = if self.echo_primary {
            input
                .inputs
                .first()
                .map(|p| p.body.clone())
                .unwrap_or_else(|| json!({}))
        } else {
            self.body.clone()
        };
        if !self.risks.is_empty() {
            if let Value::Object(map) = &mut body {
                map.insert("risks".to_string(), json!(self.risks));
            }
        }

        // Consumed ids are the upstream payload ids; an initial payload
        // carries the task's own id and is not an upstream.
        let mut consumed: Vec<TaskId> = input
            .inputs
            .iter()
            .map(|p| p.task_id.clone())
            .filter(|t| *t != input.task_id)
            .collect();
        consumed.extend(self.extra_consumed.iter().cloned());

        let success = if self.phantom_first && call == 0 {
            None
        } else {
            self.success
        };

        let mut payload = AgentPayload::new(
            input.task_id.clone(),
            self.name.clone(),
            body,
            self.op_confidence,
        )
        .with_consumed(consumed)
        .with_reasoning(self.reasoning.clone())
        .with_success(success);

        if self.tamper_hash {
            payload.content_hash = "0".repeat(64);
        }

        Ok(payload)
    }
}

/// Config with every time-based default shrunk for tests.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.backoff_schedule = vec![Duration::from_millis(1)];
    config.breaker_open_timeout = Duration::from_millis(150);
    config
}

/// An initial payload for a root task, sealed and fully confident.
pub fn initial_payload(task_id: &str, body: Value) -> AgentPayload {
    AgentPayload::new(TaskId::from(task_id), AgentId::from("caller"), body, 1.0)
}
