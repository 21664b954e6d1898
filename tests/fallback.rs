//! Human fallback: triggers, handoff summaries and guided resumption.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ralph_swarm::agents::{AgentError, ChildOutcome, NodeId, NodeStatus};
use ralph_swarm::confidence::{ConfidenceFactor, ConfidenceFactors};
use ralph_swarm::events::StateEvent;
use ralph_swarm::fallback::{FallbackError, FallbackMode, FallbackTrigger};
use ralph_swarm::llm::{ReasoningStep, ScriptEntry, ScriptedReasoner, SpawnRequest};
use ralph_swarm::{InterruptKind, OrchestratorError};
use serde_json::json;

use common::{config, drain, orchestrator, tools, wait_for_handoff, wait_for_status, Flaky};

fn echo(text: &str) -> ReasoningStep {
    ReasoningStep::tool("echo", json!({ "text": text }))
}

#[tokio::test(start_paused = true)]
async fn test_user_stop_suspends_until_guidance() {
    let reasoner = Arc::new(ScriptedReasoner::new().with_script(
        "Long task",
        vec![
            ScriptEntry::from(echo("step one")).after(Duration::from_secs(2)),
            echo("step two").into(),
            ReasoningStep::answer("finished").into(),
        ],
    ));
    let orch = orchestrator(config(), &reasoner, tools());
    let mut events = orch.subscribe();
    let handle = orch.start("Long task").unwrap();
    let root = NodeId::root("Long task");

    tokio::time::sleep(Duration::from_secs(1)).await;
    let summary = orch.interrupt(InterruptKind::Stop).unwrap().unwrap();
    assert_eq!(summary.node, root);
    assert_eq!(summary.task, "Long task");
    assert_eq!(summary.trigger, FallbackTrigger::UserStop);
    assert_eq!(summary.suspended, vec![root.clone()]);
    assert!(summary.budget.is_some());

    // A second STOP while waiting does not produce another handoff.
    assert!(orch.interrupt(InterruptKind::Stop).unwrap().is_none());

    wait_for_status(&orch, "long-task", NodeStatus::Suspended).await;
    let allocation = orch.tree().allocation(&root).unwrap();
    assert!(orch.ledger().snapshot(allocation).unwrap().is_open());

    let answered = orch.resume("focus on the tests").unwrap();
    assert_eq!(answered.node, root);
    assert!(matches!(
        orch.resume("again"),
        Err(OrchestratorError::Fallback(FallbackError::NotAwaitingGuidance))
    ));

    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, ChildOutcome::Completed("finished".to_string()));

    let contexts = reasoner.contexts_for(&root);
    assert_eq!(contexts.len(), 3);
    assert!(contexts[0].guidance.is_empty());
    assert_eq!(contexts[1].guidance, vec!["focus on the tests".to_string()]);
    assert!(contexts[2].guidance.is_empty());
    // Context accumulated before the stop is preserved.
    assert_eq!(contexts[1].history.len(), 1);

    let handoffs = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e.event, StateEvent::FallbackTriggered { .. }))
        .count();
    assert_eq!(handoffs, 1);
    assert_eq!(orch.handoffs().len(), 1);
}

#[tokio::test]
async fn test_low_confidence_step_is_handed_off() {
    let reasoner = Arc::new(ScriptedReasoner::new().with_script(
        "Assess risk",
        vec![
            echo("evidence").with_confidence(ConfidenceFactors::uniform(0.9)).into(),
            ReasoningStep::answer("risky answer")
                .with_confidence(ConfidenceFactors::uniform(0.4))
                .into(),
            ScriptEntry::from(ReasoningStep::answer("checked answer")),
        ],
    ));
    let orch = orchestrator(config(), &reasoner, tools());
    let handle = orch.start("Assess risk").unwrap();

    wait_for_handoff(&orch).await;
    let summary = orch.handoffs().remove(0);
    match &summary.trigger {
        FallbackTrigger::LowConfidence {
            score,
            threshold,
            weakest,
            contributions,
        } => {
            assert!((score - 0.4).abs() < 1e-9);
            assert!((threshold - 0.7).abs() < 1e-9);
            assert_eq!(*weakest, ConfidenceFactor::ResourceAvailability);
            assert_eq!(contributions.len(), 5);
        }
        other => panic!("unexpected trigger {:?}", other),
    }
    assert!(summary.to_string().contains("confidence 0.40 below 0.70"));

    wait_for_status(&orch, "assess-risk", NodeStatus::Suspended).await;
    orch.resume("double-check against the tests").unwrap();

    let result = handle.wait().await.unwrap();
    // The low-confidence answer was discarded, not delivered.
    assert_eq!(result.outcome, ChildOutcome::Completed("checked answer".to_string()));
    let contexts = reasoner.contexts_for(&NodeId::root("Assess risk"));
    assert_eq!(contexts.len(), 3);
    assert_eq!(contexts[2].guidance, vec!["double-check against the tests".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_second_trigger_is_recorded_on_the_pending_handoff() {
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .with_script(
                "Review",
                vec![ReasoningStep::spawn(vec![
                    SpawnRequest::new("Check schema"),
                    SpawnRequest::new("Check handlers"),
                ])],
            )
            .with_script(
                "Check schema",
                vec![
                    ScriptEntry::from(
                        ReasoningStep::answer("schema ok")
                            .with_confidence(ConfidenceFactors::uniform(0.4)),
                    ),
                    ReasoningStep::answer("schema checked").into(),
                ],
            )
            .with_script(
                "Check handlers",
                vec![
                    ScriptEntry::from(
                        ReasoningStep::answer("handlers ok")
                            .with_confidence(ConfidenceFactors::uniform(0.3)),
                    )
                    .after(Duration::from_secs(1)),
                    ReasoningStep::answer("handlers checked").into(),
                ],
            ),
    );
    let orch = orchestrator(config(), &reasoner, tools());
    let mut events = orch.subscribe();
    let handle = orch.start("Review").unwrap();

    wait_for_handoff(&orch).await;
    wait_for_status(&orch, "review/check-handlers", NodeStatus::Suspended).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let FallbackMode::AwaitingGuidance { summary } = orch.mode() else {
        panic!("handoff no longer pending");
    };
    assert_eq!(summary.node.as_str(), "review/check-schema");
    assert_eq!(summary.also_raised.len(), 1);
    assert_eq!(summary.also_raised[0].node.as_str(), "review/check-handlers");
    assert!(matches!(
        summary.also_raised[0].trigger,
        FallbackTrigger::LowConfidence { .. }
    ));
    assert!(summary.to_string().contains("Also: confidence 0.30 below 0.70"));
    assert_eq!(orch.handoffs()[0].also_raised, summary.also_raised);

    orch.resume("both are fine").unwrap();
    let result = handle.wait().await.unwrap();
    assert!(result.outcome.is_completed(), "{}", result.outcome);
    let handoffs = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e.event, StateEvent::FallbackTriggered { .. }))
        .count();
    assert_eq!(handoffs, 1);
}

#[tokio::test]
async fn test_low_confidence_again_without_guidance_fails() {
    let reasoner = Arc::new(ScriptedReasoner::new().with_script(
        "Assess risk",
        vec![
            ScriptEntry::from(
                ReasoningStep::answer("risky answer")
                    .with_confidence(ConfidenceFactors::uniform(0.4)),
            ),
            ReasoningStep::answer("still risky")
                .with_confidence(ConfidenceFactors::uniform(0.5))
                .into(),
        ],
    ));
    let orch = orchestrator(config(), &reasoner, tools());
    let handle = orch.start("Assess risk").unwrap();

    wait_for_handoff(&orch).await;
    wait_for_status(&orch, "assess-risk", NodeStatus::Suspended).await;
    orch.resume("  ").unwrap();

    let result = handle.wait().await.unwrap();
    match result.outcome {
        ChildOutcome::Failed {
            error: AgentError::LowConfidence { score, threshold },
        } => {
            assert!((score - 0.5).abs() < 1e-9);
            assert!((threshold - 0.7).abs() < 1e-9);
        }
        other => panic!("unexpected outcome {}", other),
    }
    assert_eq!(orch.handoffs().len(), 1);
}

#[tokio::test]
async fn test_consecutive_errors_escalate() {
    let mut script: Vec<ScriptEntry> = (0..4).map(|_| ScriptEntry::fail("model overloaded")).collect();
    script.push(ReasoningStep::answer("recovered").into());
    let reasoner = Arc::new(ScriptedReasoner::new().with_script("Summarize", script));
    let orch = orchestrator(config(), &reasoner, tools());
    let handle = orch.start("Summarize").unwrap();

    wait_for_handoff(&orch).await;
    match &orch.handoffs()[0].trigger {
        FallbackTrigger::ConsecutiveErrors {
            count,
            limit,
            last_error,
        } => {
            assert_eq!((*count, *limit), (4, 3));
            assert!(last_error.contains("model overloaded"));
        }
        other => panic!("unexpected trigger {:?}", other),
    }

    orch.resume("use a smaller model").unwrap();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, ChildOutcome::Completed("recovered".to_string()));
    let contexts = reasoner.contexts_for(&NodeId::root("Summarize"));
    assert_eq!(contexts[4].guidance, vec!["use a smaller model".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_node_is_handed_off() {
    let reasoner = Arc::new(ScriptedReasoner::new().with_script(
        "Slow job",
        vec![
            ScriptEntry::from(echo("late")).after(Duration::from_secs(60)),
            ReasoningStep::answer("done").into(),
        ],
    ));
    let mut config = config();
    config.fallback.stall_window = Duration::from_secs(10);
    let orch = orchestrator(config, &reasoner, tools());
    let handle = orch.start("Slow job").unwrap();

    wait_for_handoff(&orch).await;
    match &orch.handoffs()[0].trigger {
        FallbackTrigger::Stall {
            idle_secs,
            window_secs,
        } => {
            assert!(*idle_secs > 10.0);
            assert_eq!(*window_secs, 10.0);
        }
        other => panic!("unexpected trigger {:?}", other),
    }

    wait_for_status(&orch, "slow-job", NodeStatus::Suspended).await;
    orch.resume("keep going").unwrap();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, ChildOutcome::Completed("done".to_string()));
    assert_eq!(orch.handoffs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuits_on_two_tools_escalate_from_root() {
    let db = Flaky::named("db");
    let cache = Flaky::named("cache");
    let mut config = config();
    config.breaker.failure_threshold = 1;
    let reasoner = Arc::new(ScriptedReasoner::new().with_script(
        "Serve traffic",
        vec![
            ScriptEntry::from(ReasoningStep::tool("db", json!({}))),
            ReasoningStep::tool("cache", json!({})).into(),
            ReasoningStep::tool("db", json!({})).into(),
            ScriptEntry::from(echo("check status")).after(Duration::from_secs(1)),
            ReasoningStep::answer("degraded").into(),
        ],
    ));
    let orch = orchestrator(
        config,
        &reasoner,
        tools().with_tool(db.clone()).with_tool(cache.clone()),
    );
    let handle = orch.start("Serve traffic").unwrap();

    wait_for_handoff(&orch).await;
    let summary = orch.handoffs().remove(0);
    assert_eq!(summary.node, NodeId::root("Serve traffic"));
    match summary.trigger {
        FallbackTrigger::CircuitCascade { mut open_tools, limit } => {
            open_tools.sort();
            assert_eq!(open_tools, vec!["cache".to_string(), "db".to_string()]);
            assert_eq!(limit, 2);
        }
        other => panic!("unexpected trigger {:?}", other),
    }
    assert_eq!(db.calls(), 1);

    wait_for_status(&orch, "serve-traffic", NodeStatus::Suspended).await;
    orch.resume("wait for the database").unwrap();
    let result = handle.wait().await.unwrap();
    assert_eq!(result.outcome, ChildOutcome::Completed("degraded".to_string()));
}

#[tokio::test]
async fn test_interrupt_before_start_is_rejected() {
    let reasoner = Arc::new(ScriptedReasoner::new());
    let orch = orchestrator(config(), &reasoner, tools());
    assert!(matches!(
        orch.interrupt(InterruptKind::Stop),
        Err(OrchestratorError::NotStarted)
    ));
    assert!(matches!(orch.terminate("nothing"), Err(OrchestratorError::NotStarted)));

    orch.start("Only once").unwrap();
    assert!(matches!(
        orch.start("Twice"),
        Err(OrchestratorError::AlreadyStarted)
    ));
}
