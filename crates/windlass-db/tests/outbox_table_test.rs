//! Tests for the `outbox` queries: key uniqueness, replay-safe inserts, and
//! optimistic state transitions.

use serde_json::json;

use windlass_db::models::OutboxState;
use windlass_db::queries::outbox::{self as db, NewOutboxEntry};
use windlass_test_utils::create_test_db;

fn entry<'a>(key: &'a str, params: &'a serde_json::Value) -> NewOutboxEntry<'a> {
    NewOutboxEntry {
        workflow_id: "wf-1",
        task_id: "t1",
        tool_id: "http_post",
        params,
        idempotency_key: key,
        max_attempts: 3,
    }
}

#[tokio::test]
async fn store_is_idempotent_on_key() {
    let (pool, _dir) = create_test_db().await;
    let params = json!({"url": "https://example.test"});

    let first = db::store_entry(&pool, &entry("k1", &params)).await.unwrap();
    assert_eq!(first.state, OutboxState::Pending);
    assert_eq!(first.attempts, 0);

    // Same key: the original row comes back, even with different params.
    let other_params = json!({"url": "https://other.test"});
    let second = db::store_entry(&pool, &entry("k1", &other_params)).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.params, params);
}

#[tokio::test]
async fn same_key_in_different_workflows_is_distinct() {
    let (pool, _dir) = create_test_db().await;
    let params = json!({});

    let a = db::store_entry(&pool, &entry("k1", &params)).await.unwrap();
    let b = db::store_entry(
        &pool,
        &NewOutboxEntry {
            workflow_id: "wf-2",
            ..entry("k1", &params)
        },
    )
    .await
    .unwrap();
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn processing_claim_increments_attempts() {
    let (pool, _dir) = create_test_db().await;
    let params = json!({});
    let stored = db::store_entry(&pool, &entry("k1", &params)).await.unwrap();

    let rows = db::mark_processing(&pool, stored.id, OutboxState::Pending).await.unwrap();
    assert_eq!(rows, 1);
    // A second claim against `pending` loses the optimistic check.
    let rows = db::mark_processing(&pool, stored.id, OutboxState::Pending).await.unwrap();
    assert_eq!(rows, 0);

    let current = db::get_by_id(&pool, stored.id).await.unwrap().unwrap();
    assert_eq!(current.state, OutboxState::Processing);
    assert_eq!(current.attempts, 1);
}

#[tokio::test]
async fn commit_records_result_and_timestamp() {
    let (pool, _dir) = create_test_db().await;
    let params = json!({});
    let stored = db::store_entry(&pool, &entry("k1", &params)).await.unwrap();
    db::mark_processing(&pool, stored.id, OutboxState::Pending).await.unwrap();

    let rows = db::mark_committed(&pool, stored.id, &json!({"status": "ok"})).await.unwrap();
    assert_eq!(rows, 1);

    let current = db::get_by_id(&pool, stored.id).await.unwrap().unwrap();
    assert_eq!(current.state, OutboxState::Committed);
    assert_eq!(current.result, Some(json!({"status": "ok"})));
    assert!(current.committed_at.is_some());

    // Committing twice is refused by the state check.
    let rows = db::mark_committed(&pool, stored.id, &json!({"status": "again"})).await.unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn failure_paths_and_revival() {
    let (pool, _dir) = create_test_db().await;
    let params = json!({});
    let stored = db::store_entry(&pool, &entry("k1", &params)).await.unwrap();
    db::mark_processing(&pool, stored.id, OutboxState::Pending).await.unwrap();
    db::mark_failed(&pool, stored.id, "connection refused", OutboxState::Failed)
        .await
        .unwrap();

    let current = db::get_by_id(&pool, stored.id).await.unwrap().unwrap();
    assert_eq!(current.state, OutboxState::Failed);
    assert_eq!(current.error.as_deref(), Some("connection refused"));

    // Revive and exhaust into the dead letter state.
    db::reset_to_pending(&pool, stored.id, OutboxState::Failed).await.unwrap();
    db::mark_processing(&pool, stored.id, OutboxState::Pending).await.unwrap();
    db::mark_failed(&pool, stored.id, "still broken", OutboxState::DeadLetter)
        .await
        .unwrap();

    let current = db::get_by_id(&pool, stored.id).await.unwrap().unwrap();
    assert_eq!(current.state, OutboxState::DeadLetter);
    assert_eq!(current.attempts, 2);
}

#[tokio::test]
async fn listing_splits_terminal_from_live() {
    let (pool, _dir) = create_test_db().await;
    let params = json!({});

    let live = db::store_entry(&pool, &entry("live", &params)).await.unwrap();
    let committed = db::store_entry(&pool, &entry("committed", &params)).await.unwrap();
    db::mark_processing(&pool, committed.id, OutboxState::Pending).await.unwrap();
    db::mark_committed(&pool, committed.id, &json!({})).await.unwrap();

    let non_terminal = db::list_non_terminal(&pool).await.unwrap();
    assert_eq!(non_terminal.len(), 1);
    assert_eq!(non_terminal[0].id, live.id);

    let committed_rows = db::list_committed(&pool).await.unwrap();
    assert_eq!(committed_rows.len(), 1);
    assert_eq!(committed_rows[0].id, committed.id);

    let removed = db::delete_entries(&pool, &[committed.id]).await.unwrap();
    assert_eq!(removed, 1);
    assert!(db::list_committed(&pool).await.unwrap().is_empty());
}
