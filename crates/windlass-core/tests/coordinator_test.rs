//! Tests for the multi-agent coordinator: deadlock detection and
//! mitigation, livelock handling, escalation, and lock reaping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use windlass_core::coordinator::{
    ContentionKind, Coordinator, EscalationContext, EscalationHandler, LockMode,
    LivelockConfig, MitigationStrategy, ResourcePolicy,
};
use windlass_core::events::{EventLog, EventType, MemoryEventLog};

#[tokio::test]
async fn deadlock_cycle_is_detected_and_aborted() {
    let events = Arc::new(MemoryEventLog::new());
    let coordinator = Coordinator::new().with_event_log(events.clone());
    coordinator.set_policy("R1", ResourcePolicy::exclusive()).await;
    coordinator.set_policy("R2", ResourcePolicy::exclusive()).await;

    // Agent1 holds R1, Agent2 holds R2; each requests the other.
    assert!(coordinator.acquire_lock("R1", "agent-1", "wf-1", LockMode::Write).await);
    assert!(coordinator.acquire_lock("R2", "agent-2", "wf-2", LockMode::Write).await);
    assert!(!coordinator.acquire_lock("R2", "agent-1", "wf-1", LockMode::Write).await);
    assert!(!coordinator.acquire_lock("R1", "agent-2", "wf-2", LockMode::Write).await);

    let detection = coordinator.detect_deadlock().await.expect("deadlock expected");
    assert_eq!(detection.cycle.len(), 2);
    assert!(detection.cycle.contains(&"agent-1".to_owned()));
    assert!(detection.cycle.contains(&"agent-2".to_owned()));
    assert_eq!(detection.resources, vec!["R1".to_owned(), "R2".to_owned()]);

    let outcome = coordinator
        .mitigate_deadlock(&detection, MitigationStrategy::Abort)
        .await;
    // Deterministic victim: lowest agent id.
    assert_eq!(outcome.victim.as_deref(), Some("agent-1"));
    assert_eq!(outcome.released.len(), 1);
    assert_eq!(outcome.workflows_marked, vec!["wf-1".to_owned()]);
    assert!(coordinator.is_workflow_aborted("wf-1").await);
    assert!(!coordinator.is_workflow_aborted("wf-2").await);

    // The survivor's pending request now succeeds on its next poll.
    assert!(coordinator.acquire_lock("R1", "agent-2", "wf-2", LockMode::Write).await);
    assert!(coordinator.detect_deadlock().await.is_none());

    // Events: deadlock_detected for both workflows, lock events throughout.
    let wf1_events = events.read("wf-1", None).await.unwrap();
    assert!(
        wf1_events
            .iter()
            .any(|e| e.event_type == EventType::DeadlockDetected)
    );
    assert!(
        wf1_events
            .iter()
            .any(|e| e.event_type == EventType::LockReleased
                && e.metadata["reason"] == json!("abort"))
    );
}

#[tokio::test]
async fn replan_releases_and_clears_history() {
    let coordinator = Coordinator::new().with_livelock_config(LivelockConfig {
        window_size: 6,
        max_cycle_len: 2,
        repeats: 3,
    });
    coordinator.set_policy("R1", ResourcePolicy::exclusive()).await;
    assert!(coordinator.acquire_lock("R1", "agent-1", "wf-1", LockMode::Write).await);

    for i in 0..6 {
        let state = if i % 2 == 0 {
            json!({"phase": "claim"})
        } else {
            json!({"phase": "yield"})
        };
        coordinator.record_state("agent-1", "wf-1", "t1", &state).await;
    }

    let detection = coordinator
        .detect_livelock("agent-1")
        .await
        .expect("livelock expected");
    assert_eq!(detection.cycle.len(), 2);

    let outcome = coordinator
        .mitigate_livelock(&detection, MitigationStrategy::Replan)
        .await;
    assert_eq!(outcome.victim.as_deref(), Some("agent-1"));
    assert_eq!(outcome.released.len(), 1);
    // REPLAN does not mark workflows for failure.
    assert!(outcome.workflows_marked.is_empty());
    assert!(!coordinator.is_workflow_aborted("wf-1").await);

    // History cleared: no livelock until the cycle re-accumulates.
    assert!(coordinator.detect_livelock("agent-1").await.is_none());
    assert!(coordinator.locks_for("R1").await.is_empty());
}

#[tokio::test]
async fn escalation_invokes_the_registered_handler() {
    #[derive(Default)]
    struct Capture {
        contexts: Mutex<Vec<EscalationContext>>,
    }

    #[async_trait]
    impl EscalationHandler for Capture {
        async fn escalate(&self, context: EscalationContext) {
            self.contexts.lock().await.push(context);
        }
    }

    let coordinator = Coordinator::new();
    coordinator.set_policy("R1", ResourcePolicy::exclusive()).await;
    coordinator.set_policy("R2", ResourcePolicy::exclusive()).await;
    let handler = Arc::new(Capture::default());
    coordinator.set_escalation_handler(handler.clone());

    coordinator.acquire_lock("R1", "agent-1", "wf-1", LockMode::Write).await;
    coordinator.acquire_lock("R2", "agent-2", "wf-2", LockMode::Write).await;
    coordinator.acquire_lock("R2", "agent-1", "wf-1", LockMode::Write).await;
    coordinator.acquire_lock("R1", "agent-2", "wf-2", LockMode::Write).await;

    let detection = coordinator.detect_deadlock().await.unwrap();
    let outcome = coordinator
        .mitigate_deadlock(&detection, MitigationStrategy::Escalate)
        .await;
    // ESCALATE releases nothing itself.
    assert!(outcome.released.is_empty());
    assert_eq!(coordinator.locks_for("R1").await.len(), 1);

    let contexts = handler.contexts.lock().await;
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].kind, ContentionKind::Deadlock);
    assert_eq!(contexts[0].agents.len(), 2);
    assert_eq!(contexts[0].resources, vec!["R1".to_owned(), "R2".to_owned()]);
}

#[tokio::test]
async fn wait_strategy_changes_nothing() {
    let coordinator = Coordinator::new();
    coordinator.set_policy("R1", ResourcePolicy::exclusive()).await;
    coordinator.set_policy("R2", ResourcePolicy::exclusive()).await;
    coordinator.acquire_lock("R1", "agent-1", "wf-1", LockMode::Write).await;
    coordinator.acquire_lock("R2", "agent-2", "wf-2", LockMode::Write).await;
    coordinator.acquire_lock("R2", "agent-1", "wf-1", LockMode::Write).await;
    coordinator.acquire_lock("R1", "agent-2", "wf-2", LockMode::Write).await;

    let detection = coordinator.detect_deadlock().await.unwrap();
    let outcome = coordinator
        .mitigate_deadlock(&detection, MitigationStrategy::Wait)
        .await;
    assert!(outcome.victim.is_none());
    assert!(outcome.released.is_empty());

    // The cycle is still there on the rescheduled detection.
    assert!(coordinator.detect_deadlock().await.is_some());
}

#[tokio::test]
async fn shared_policy_allows_readers_blocks_writer() {
    let coordinator = Coordinator::new();
    coordinator
        .set_policy("doc", ResourcePolicy::shared().with_max_concurrent(3))
        .await;

    assert!(coordinator.acquire_lock("doc", "r1", "wf-1", LockMode::Read).await);
    assert!(coordinator.acquire_lock("doc", "r2", "wf-2", LockMode::Read).await);
    assert!(!coordinator.acquire_lock("doc", "w1", "wf-3", LockMode::Write).await);

    // Readers drain, writer gets in, further readers are blocked.
    coordinator.release_lock("doc", "r1", "wf-1").await;
    coordinator.release_lock("doc", "r2", "wf-2").await;
    assert!(coordinator.acquire_lock("doc", "w1", "wf-3", LockMode::Write).await);
    assert!(!coordinator.acquire_lock("doc", "r3", "wf-4", LockMode::Read).await);
}

#[tokio::test]
async fn reaper_emits_timeout_release_events() {
    let events = Arc::new(MemoryEventLog::new());
    let coordinator = Coordinator::new().with_event_log(events.clone());
    coordinator
        .set_policy(
            "R1",
            ResourcePolicy::exclusive().with_lock_timeout(Duration::from_millis(10)),
        )
        .await;

    assert!(coordinator.acquire_lock("R1", "agent-1", "wf-1", LockMode::Write).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let reaped = coordinator.reap_expired().await;
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].resource_id, "R1");

    let wf_events = events.read("wf-1", None).await.unwrap();
    assert!(
        wf_events
            .iter()
            .any(|e| e.event_type == EventType::LockReleased
                && e.metadata["reason"] == json!("timeout"))
    );

    // The resource is free again.
    assert!(coordinator.acquire_lock("R1", "agent-2", "wf-2", LockMode::Write).await);
}
