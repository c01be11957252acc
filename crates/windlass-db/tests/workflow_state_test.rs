//! Tests for the `workflow_state` queries: creation idempotency, tenant
//! scoping, and optimistic status transitions.

use chrono::Utc;

use windlass_db::models::WorkflowStatus;
use windlass_db::queries::workflows as db;
use windlass_test_utils::create_test_db;

#[tokio::test]
async fn ensure_workflow_is_idempotent() {
    let (pool, _dir) = create_test_db().await;

    let first = db::ensure_workflow(&pool, "wf-1", Some("acme")).await.unwrap();
    assert_eq!(first.status, WorkflowStatus::Pending);
    assert_eq!(first.tenant_id.as_deref(), Some("acme"));

    // Second call returns the same row, not a reset one.
    db::transition_workflow_status(
        &pool,
        "wf-1",
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        Some(Utc::now()),
        None,
    )
    .await
    .unwrap();

    let again = db::ensure_workflow(&pool, "wf-1", Some("acme")).await.unwrap();
    assert_eq!(again.status, WorkflowStatus::Running);
    assert!(again.started_at.is_some());
}

#[tokio::test]
async fn transition_uses_optimistic_locking() {
    let (pool, _dir) = create_test_db().await;
    db::ensure_workflow(&pool, "wf-1", None).await.unwrap();

    // Wrong `from` status touches no rows.
    let rows = db::transition_workflow_status(
        &pool,
        "wf-1",
        WorkflowStatus::Running,
        WorkflowStatus::Completed,
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);

    let rows = db::transition_workflow_status(
        &pool,
        "wf-1",
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        Some(Utc::now()),
        None,
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn tenant_scoped_reads_filter() {
    let (pool, _dir) = create_test_db().await;
    db::ensure_workflow(&pool, "wf-acme", Some("acme")).await.unwrap();
    db::ensure_workflow(&pool, "wf-open", None).await.unwrap();

    // Matching tenant sees the row.
    assert!(
        db::get_workflow_for_tenant(&pool, "wf-acme", Some("acme"))
            .await
            .unwrap()
            .is_some()
    );
    // Non-matching tenant sees nothing.
    assert!(
        db::get_workflow_for_tenant(&pool, "wf-acme", Some("globex"))
            .await
            .unwrap()
            .is_none()
    );
    // A tenant-scoped read never sees untenanted rows.
    assert!(
        db::get_workflow_for_tenant(&pool, "wf-open", Some("acme"))
            .await
            .unwrap()
            .is_none()
    );
    // An administrative read sees everything.
    assert!(
        db::get_workflow_for_tenant(&pool, "wf-acme", None)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn failed_workflow_resets_for_rerun() {
    let (pool, _dir) = create_test_db().await;
    db::ensure_workflow(&pool, "wf-1", None).await.unwrap();
    db::transition_workflow_status(
        &pool,
        "wf-1",
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        Some(Utc::now()),
        None,
    )
    .await
    .unwrap();
    db::transition_workflow_status(
        &pool,
        "wf-1",
        WorkflowStatus::Running,
        WorkflowStatus::Failed,
        None,
        Some(Utc::now()),
    )
    .await
    .unwrap();
    db::set_workflow_error(&pool, "wf-1", "TOOL_ERROR: boom").await.unwrap();

    let rows = db::reset_failed_workflow(&pool, "wf-1").await.unwrap();
    assert_eq!(rows, 1);

    let workflow = db::get_workflow(&pool, "wf-1").await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Running);
    assert!(workflow.error.is_none());
    assert!(workflow.completed_at.is_none());

    // Resetting a non-failed workflow is a no-op.
    assert_eq!(db::reset_failed_workflow(&pool, "wf-1").await.unwrap(), 0);
}
