//! Guardrail activation scenarios: phantom success, integrity,
//! confidence collapse, sycophancy, schema and dependency checks.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use tandem::{
    AgentRole, CheckpointId, FailureKind, GuardrailKind, Orchestrator, TaskId, TaskNode,
    TaskState,
};

use crate::fixtures::{fast_config, initial_payload, ScriptedAgent};

fn single_node_orchestrator(agent: ScriptedAgent) -> Orchestrator {
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent("worker", Arc::new(agent));
    orchestrator
}

#[tokio::test]
async fn test_phantom_success_fails_without_retry() {
    let orchestrator = single_node_orchestrator(
        ScriptedAgent::new("worker", AgentRole::Worker).success(None),
    );
    let handle = orchestrator
        .submit(
            vec![TaskNode::new("t1", "worker").max_retries(3)],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    let record = &report.tasks[&TaskId::from("t1")];
    assert!(matches!(
        record.state,
        TaskState::Failed {
            kind: FailureKind::ToolPhantomSuccess,
            ..
        }
    ));
    assert!(record.retry_history.is_empty(), "phantom success must not retry");
    assert!(orchestrator
        .verifier()
        .get(&CheckpointId::from("t1"))
        .is_none());
    assert!(report
        .guardrails
        .iter()
        .any(|g| g.kind == GuardrailKind::PhantomSuccess));
}

#[tokio::test]
async fn test_false_success_indicator_is_phantom() {
    let orchestrator = single_node_orchestrator(
        ScriptedAgent::new("worker", AgentRole::Worker).success(Some(false)),
    );
    let handle = orchestrator
        .submit(vec![TaskNode::new("t1", "worker")], HashMap::new())
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();
    assert!(matches!(
        report.state_of(&TaskId::from("t1")),
        Some(TaskState::Failed {
            kind: FailureKind::ToolPhantomSuccess,
            ..
        })
    ));
}

#[tokio::test]
async fn test_tampered_output_is_integrity_violation() {
    let agent = ScriptedAgent::new("worker", AgentRole::Worker).tampered();
    let orchestrator = Orchestrator::new(fast_config());
    let agent = Arc::new(agent);
    orchestrator.register_agent("worker", agent.clone());

    let handle = orchestrator
        .submit(
            vec![TaskNode::new("t1", "worker").max_retries(3)],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(matches!(
        report.state_of(&TaskId::from("t1")),
        Some(TaskState::Failed {
            kind: FailureKind::IntegrityViolation,
            ..
        })
    ));
    assert_eq!(agent.calls(), 1, "integrity violations must not retry");
    assert!(orchestrator
        .verifier()
        .get(&CheckpointId::from("t1"))
        .is_none());
}

#[tokio::test]
async fn test_tampered_input_fails_before_invocation() {
    let agent = Arc::new(ScriptedAgent::new("worker", AgentRole::Worker));
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent("worker", agent.clone());

    let mut tampered = initial_payload("t1", json!({"topic": "launch"}));
    tampered.body = json!({"topic": "something else entirely"});
    let mut initial = HashMap::new();
    initial.insert(TaskId::from("t1"), tampered);

    let handle = orchestrator
        .submit(vec![TaskNode::new("t1", "worker")], initial)
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(matches!(
        report.state_of(&TaskId::from("t1")),
        Some(TaskState::Failed {
            kind: FailureKind::IntegrityViolation,
            ..
        })
    ));
    assert_eq!(agent.calls(), 0, "agent must not see tampered input");
    assert!(report
        .guardrails
        .iter()
        .any(|g| g.kind == GuardrailKind::Desync));
}

#[tokio::test]
async fn test_low_confidence_collapses_chain() {
    let orchestrator = single_node_orchestrator(
        ScriptedAgent::new("worker", AgentRole::Worker).confidence(0.4),
    );
    let handle = orchestrator
        .submit(vec![TaskNode::new("t1", "worker")], HashMap::new())
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(matches!(
        report.state_of(&TaskId::from("t1")),
        Some(TaskState::Failed {
            kind: FailureKind::ConfidenceCollapse,
            ..
        })
    ));
    assert!(
        orchestrator.verifier().get(&CheckpointId::from("t1")).is_none(),
        "a collapsed task never seals a checkpoint"
    );
    assert!(report
        .guardrails
        .iter()
        .any(|g| g.kind == GuardrailKind::ConfidenceCollapse));
}

/// With decay disabled, a chain that stays above the floor but below the
/// low-confidence boundary for more steps than the cap still collapses.
#[tokio::test]
async fn test_chained_low_confidence_exceeding_cap_collapses() {
    let mut config = fast_config();
    config.depth_decay = 1.0;
    let orchestrator = Orchestrator::new(config);
    orchestrator.register_agent(
        "steady",
        Arc::new(ScriptedAgent::new("steady", AgentRole::Worker).confidence(1.0)),
    );

    let nodes = vec![
        TaskNode::new("t1", "steady"),
        TaskNode::new("t2", "steady").depends_on(["t1"]),
        TaskNode::new("t3", "steady").depends_on(["t2"]),
        TaskNode::new("t4", "steady").depends_on(["t3"]),
        TaskNode::new("t5", "steady").depends_on(["t4"]),
    ];
    // Initial confidence 0.6: every step lands in [0.5, 0.7), so the
    // streak grows until it passes the cap of 3 at the fourth task.
    let mut initial = HashMap::new();
    initial.insert(
        TaskId::from("t1"),
        {
            let mut p = initial_payload("t1", json!({"seed": true}));
            p.confidence = 0.6;
            p
        },
    );

    let handle = orchestrator.submit(nodes, initial).unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(matches!(
        report.state_of(&TaskId::from("t4")),
        Some(TaskState::Failed {
            kind: FailureKind::ConfidenceCollapse,
            ..
        })
    ));
    // The chain is halted: t3's checkpoint is the last good state and
    // the never-run t5 is part of the rollback.
    assert_eq!(report.state_of(&TaskId::from("t3")), Some(&TaskState::Success));
    assert_eq!(report.state_of(&TaskId::from("t5")), Some(&TaskState::RolledBack));
    let rollback = report.rollback.as_ref().unwrap();
    assert_eq!(rollback.last_good, Some(CheckpointId::from("t3")));
}

#[tokio::test]
async fn test_output_schema_violation_is_non_retryable() {
    let agent = Arc::new(
        ScriptedAgent::new("worker", AgentRole::Worker).body(json!({"wrong_field": 1})),
    );
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent("worker", agent.clone());

    let schema = json!({
        "type": "object",
        "required": ["title"],
        "properties": {"title": {"type": "string"}}
    });
    let handle = orchestrator
        .submit(
            vec![TaskNode::new("t1", "worker")
                .output_schema(schema)
                .max_retries(3)],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(matches!(
        report.state_of(&TaskId::from("t1")),
        Some(TaskState::Failed {
            kind: FailureKind::SchemaViolation,
            ..
        })
    ));
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn test_malformed_schema_rejected_at_submission() {
    let orchestrator = single_node_orchestrator(ScriptedAgent::new("worker", AgentRole::Worker));
    let err = orchestrator
        .submit(
            vec![TaskNode::new("t1", "worker").output_schema(json!({"type": 42}))],
            HashMap::new(),
        )
        .unwrap_err();
    match err {
        tandem::Error::Submission { kind, .. } => {
            assert_eq!(kind, FailureKind::SchemaRejected);
        }
        other => panic!("expected submission error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_payload_claiming_undeclared_upstream_fails() {
    let orchestrator = single_node_orchestrator(
        ScriptedAgent::new("worker", AgentRole::Worker).claims_consumed("ghost"),
    );
    let handle = orchestrator
        .submit(vec![TaskNode::new("t1", "worker")], HashMap::new())
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(matches!(
        report.state_of(&TaskId::from("t1")),
        Some(TaskState::Failed {
            kind: FailureKind::HallucinatedDependency,
            ..
        })
    ));
    assert!(report
        .guardrails
        .iter()
        .any(|g| g.kind == GuardrailKind::HallucinatedDependency));
}

/// A sycophantic adversary: identical output, empty reasoning trace.
/// The task fails even though disagreement is low.
#[tokio::test]
async fn test_null_adversary_is_sycophancy() {
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent(
        "publisher",
        Arc::new(ScriptedAgent::new("publisher", AgentRole::Publisher).confidence(0.9)),
    );
    orchestrator.register_agent(
        "rubber-stamp",
        Arc::new(
            ScriptedAgent::new("rubber-stamp", AgentRole::Adversarial)
                .echoing()
                .no_reasoning(),
        ),
    );

    let handle = orchestrator
        .submit(
            vec![TaskNode::new("post", "publisher").challenged_by("rubber-stamp")],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(matches!(
        report.state_of(&TaskId::from("post")),
        Some(TaskState::Failed {
            kind: FailureKind::SycophancySuspected,
            ..
        })
    ));
    assert!(report
        .guardrails
        .iter()
        .any(|g| g.kind == GuardrailKind::Sycophancy));
}

/// A genuinely disagreeing adversary flags the payload for human review
/// without failing the task.
#[tokio::test]
async fn test_disagreeing_adversary_flags_human_review() {
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent(
        "writer",
        Arc::new(
            ScriptedAgent::new("writer", AgentRole::Generator)
                .confidence(0.9)
                .body(json!({"text": "the quarterly numbers look great"})),
        ),
    );
    orchestrator.register_agent(
        "skeptic",
        Arc::new(
            ScriptedAgent::new("skeptic", AgentRole::Adversarial)
                .body(json!({"critique": "several claims lack citations"}))
                .risks(&["unverified figures", "overstated growth", "missing sources"]),
        ),
    );

    let handle = orchestrator
        .submit(
            vec![TaskNode::new("draft", "writer")
                .high_stakes(true)
                .challenged_by("skeptic")],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(report.all_succeeded(), "disagreement alone must not fail the task");
    assert_eq!(report.human_review, vec![TaskId::from("draft")]);
    let payload = report.tasks[&TaskId::from("draft")].payload.as_ref().unwrap();
    assert!(payload.metadata.requires_human_review);
    assert!(payload.metadata.extra.contains_key("adversarial_review"));
    assert!(report
        .guardrails
        .iter()
        .any(|g| g.kind == GuardrailKind::Sycophancy));
}

/// Validator blending: outgoing = 0.7*primary + 0.3*validator.
#[tokio::test]
async fn test_validator_blends_confidence() {
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent(
        "writer",
        Arc::new(ScriptedAgent::new("writer", AgentRole::Generator).confidence(0.9)),
    );
    orchestrator.register_agent(
        "checker",
        Arc::new(ScriptedAgent::new("checker", AgentRole::Validator).confidence(0.5)),
    );

    let handle = orchestrator
        .submit(
            vec![TaskNode::new("t1", "writer").validated_by("checker")],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(report.all_succeeded());
    let payload = report.tasks[&TaskId::from("t1")].payload.as_ref().unwrap();
    assert!((payload.confidence - (0.7 * 0.9 + 0.3 * 0.5)).abs() < 1e-9);
    assert!(payload.metadata.extra.contains_key("validation"));
}

/// Transient failures are retried with backoff up to the budget, and the
/// retry history survives into the terminal record.
#[tokio::test]
async fn test_transient_failures_retry_then_succeed() {
    let agent = Arc::new(
        ScriptedAgent::new("worker", AgentRole::Worker)
            .confidence(0.95)
            .fail_first(2),
    );
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent("worker", agent.clone());

    let handle = orchestrator
        .submit(
            vec![TaskNode::new("t1", "worker").max_retries(3)],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(report.all_succeeded());
    assert_eq!(agent.calls(), 3);
    let record = &report.tasks[&TaskId::from("t1")];
    assert_eq!(record.retry_history.len(), 2);
    assert!(record
        .retry_history
        .iter()
        .all(|a| a.kind == FailureKind::AgentTransient));
}

/// A deadline overrun is a retryable timeout; exhausting the budget
/// reports AGENT_TIMEOUT with the full attempt history.
#[tokio::test]
async fn test_timeout_is_retryable_until_exhausted() {
    let agent = Arc::new(
        ScriptedAgent::new("slow", AgentRole::Worker)
            .sleeping(std::time::Duration::from_millis(200)),
    );
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent("slow", agent.clone());

    let handle = orchestrator
        .submit(
            vec![TaskNode::new("t1", "slow")
                .timeout(std::time::Duration::from_millis(30))
                .max_retries(1)],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    let record = &report.tasks[&TaskId::from("t1")];
    assert!(matches!(
        record.state,
        TaskState::Failed {
            kind: FailureKind::AgentTimeout,
            ..
        }
    ));
    assert_eq!(record.retry_history.len(), 2);
}
