//! Failure recovery: rollback over the checkpoint chain, idempotent
//! re-runs, forced refresh of expired checkpoints, and cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tandem::{
    AgentRole, CheckpointId, CheckpointVerdict, FailureKind, GuardrailKind, Orchestrator, TaskId,
    TaskNode, TaskState,
};

use crate::fixtures::{fast_config, ScriptedAgent};

/// A failure rolls back to the most recent VALID upstream checkpoint.
#[tokio::test]
async fn test_rollback_stops_at_valid_checkpoint() {
    let orchestrator = Orchestrator::new(fast_config());
    for name in ["a-agent", "b-agent"] {
        orchestrator.register_agent(
            name,
            Arc::new(ScriptedAgent::new(name, AgentRole::Generator).confidence(0.95)),
        );
    }
    orchestrator.register_agent(
        "c-agent",
        Arc::new(ScriptedAgent::new("c-agent", AgentRole::Generator).tampered()),
    );

    let nodes = vec![
        TaskNode::new("a", "a-agent"),
        TaskNode::new("b", "b-agent").depends_on(["a"]),
        TaskNode::new("c", "c-agent").depends_on(["b"]),
    ];
    let handle = orchestrator.submit(nodes, HashMap::new()).unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert_eq!(report.state_of(&TaskId::from("a")), Some(&TaskState::Success));
    assert_eq!(report.state_of(&TaskId::from("b")), Some(&TaskState::Success));
    assert!(matches!(
        report.state_of(&TaskId::from("c")),
        Some(TaskState::Failed {
            kind: FailureKind::IntegrityViolation,
            ..
        })
    ));

    let rollback = report.rollback.as_ref().unwrap();
    assert_eq!(rollback.failed_task, TaskId::from("c"));
    assert_eq!(rollback.last_good, Some(CheckpointId::from("b")));
    // The reported last-good checkpoint still verifies VALID.
    assert_eq!(
        orchestrator.verifier().verify_stored(&CheckpointId::from("b")),
        CheckpointVerdict::Valid
    );
}

/// When the predecessor chain has expired, rollback walks past it and
/// discards the work it covered.
#[tokio::test]
async fn test_rollback_walks_past_expired_checkpoints() {
    let mut config = fast_config();
    config.default_ttl = Duration::from_millis(50);
    let orchestrator = Orchestrator::new(config);
    orchestrator.register_agent(
        "a-agent",
        Arc::new(ScriptedAgent::new("a-agent", AgentRole::Generator).confidence(0.95)),
    );
    orchestrator.register_agent(
        "b-agent",
        Arc::new(
            ScriptedAgent::new("b-agent", AgentRole::Generator)
                .sleeping(Duration::from_millis(100))
                .tampered(),
        ),
    );

    let nodes = vec![
        TaskNode::new("a", "a-agent"),
        TaskNode::new("b", "b-agent").depends_on(["a"]).max_retries(0),
        TaskNode::new("c", "a-agent").depends_on(["b"]),
    ];
    let handle = orchestrator.submit(nodes, HashMap::new()).unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    // By the time b fails, a's checkpoint has outlived its TTL; nothing
    // on the chain verifies and everything sealed is discarded.
    let rollback = report.rollback.as_ref().unwrap();
    assert_eq!(rollback.last_good, None);
    assert!(rollback.rolled_back.contains(&TaskId::from("a")));

    let record_a = &report.tasks[&TaskId::from("a")];
    assert_eq!(record_a.state, TaskState::RolledBack);
    assert!(record_a.payload.is_none(), "rolled-back payloads are discarded");
    assert_eq!(report.state_of(&TaskId::from("c")), Some(&TaskState::RolledBack));
    assert!(report.sealed_checkpoints.is_empty());
}

/// An idempotent task is re-run once against the rolled-back state
/// without user intervention.
#[tokio::test]
async fn test_idempotent_task_reruns_after_rollback() {
    let agent = Arc::new(
        ScriptedAgent::new("worker", AgentRole::Worker)
            .confidence(0.95)
            .phantom_first(),
    );
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent("worker", agent.clone());

    let handle = orchestrator
        .submit(
            vec![TaskNode::new("t1", "worker").max_retries(0).idempotent(true)],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(report.all_succeeded(), "idempotent re-run should recover the task");
    assert_eq!(agent.calls(), 2);
    assert!(report.rollback.is_none());
    assert!(report
        .guardrails
        .iter()
        .any(|g| g.kind == GuardrailKind::PhantomSuccess));
}

/// A non-idempotent task is not re-run; the run ends with the verdict.
#[tokio::test]
async fn test_non_idempotent_task_ends_the_run() {
    let agent = Arc::new(
        ScriptedAgent::new("worker", AgentRole::Worker)
            .confidence(0.95)
            .phantom_first(),
    );
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent("worker", agent.clone());

    let handle = orchestrator
        .submit(
            vec![TaskNode::new("t1", "worker").max_retries(0)],
            HashMap::new(),
        )
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert_eq!(agent.calls(), 1);
    assert!(report.rollback.is_some());
    assert!(matches!(
        report.state_of(&TaskId::from("t1")),
        Some(TaskState::Failed {
            kind: FailureKind::ToolPhantomSuccess,
            ..
        })
    ));
}

/// An expired predecessor is re-sealed before the next checkpoint is
/// chained on top of it (the desynchronization guardrail).
#[tokio::test]
async fn test_expired_predecessor_forces_refresh() {
    let mut config = fast_config();
    config.default_ttl = Duration::from_millis(50);
    let orchestrator = Orchestrator::new(config);
    orchestrator.register_agent(
        "fast",
        Arc::new(ScriptedAgent::new("fast", AgentRole::Generator).confidence(0.95)),
    );
    orchestrator.register_agent(
        "slow",
        Arc::new(
            ScriptedAgent::new("slow", AgentRole::Generator)
                .confidence(0.95)
                .sleeping(Duration::from_millis(100)),
        ),
    );

    let nodes = vec![
        TaskNode::new("a", "fast"),
        TaskNode::new("b", "slow").depends_on(["a"]),
    ];
    let handle = orchestrator.submit(nodes, HashMap::new()).unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(report.all_succeeded());
    assert!(report
        .guardrails
        .iter()
        .any(|g| g.kind == GuardrailKind::Desync && g.task_id == TaskId::from("b")));
    // Both checkpoints are live after the refresh.
    assert_eq!(
        orchestrator.verifier().verify_stored(&CheckpointId::from("a")),
        CheckpointVerdict::Valid
    );
    assert_eq!(
        orchestrator.verifier().verify_stored(&CheckpointId::from("b")),
        CheckpointVerdict::Valid
    );
}

/// Global cancellation aborts in-flight work and preserves already
/// sealed checkpoints.
#[tokio::test]
async fn test_cancellation_aborts_run() {
    let orchestrator = Arc::new(Orchestrator::new(fast_config()));
    orchestrator.register_agent(
        "fast",
        Arc::new(ScriptedAgent::new("fast", AgentRole::Generator).confidence(0.95)),
    );
    orchestrator.register_agent(
        "stuck",
        Arc::new(
            ScriptedAgent::new("stuck", AgentRole::Worker)
                .sleeping(Duration::from_secs(30))
                .confidence(0.95),
        ),
    );

    let nodes = vec![
        TaskNode::new("a", "fast"),
        TaskNode::new("b", "stuck").depends_on(["a"]),
    ];
    let handle = orchestrator.submit(nodes, HashMap::new()).unwrap();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(&handle).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.cancel(&handle).unwrap();
    let report = runner.await.unwrap();

    assert!(report.cancelled);
    assert!(matches!(
        report.state_of(&TaskId::from("b")),
        Some(TaskState::Failed { .. })
    ));
    // a's checkpoint survives for a later rollback decision.
    assert!(orchestrator
        .verifier()
        .get(&CheckpointId::from("a"))
        .is_some());
}

/// Initial payloads carry domain state into the first level.
#[tokio::test]
async fn test_initial_payload_reaches_root_agent() {
    let orchestrator = Orchestrator::new(fast_config());
    orchestrator.register_agent(
        "echo",
        Arc::new(
            ScriptedAgent::new("echo", AgentRole::Generator)
                .confidence(0.95)
                .echoing(),
        ),
    );

    let body = json!({"brief": "write the launch post"});
    let mut initial = HashMap::new();
    initial.insert(
        TaskId::from("t1"),
        crate::fixtures::initial_payload("t1", body.clone()),
    );

    let handle = orchestrator
        .submit(vec![TaskNode::new("t1", "echo")], initial)
        .unwrap();
    let report = orchestrator.run(&handle).await.unwrap();

    assert!(report.all_succeeded());
    let payload = report.tasks[&TaskId::from("t1")].payload.as_ref().unwrap();
    assert_eq!(payload.body, body);
}
