//! Tests for the task execution service: the full worker lifecycle,
//! admission control, cancellation, lease loss and crash recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    wait_for, DeadlineExecutor, EchoExecutor, FailingExecutor, PanickingExecutor,
    RecordingHistoryStore, SlowExecutor,
};

use agentd_core::error::CoreError;
use agentd_core::events::EventBroadcaster;
use agentd_core::history::AsyncEventHistoryStore;
use agentd_core::service::{
    AgentExecutor, ExecuteTaskRequest, ExecutionConfig, TaskExecutionService,
};
use agentd_core::store::{InMemoryTaskStore, TaskStore};
use agentd_core::types::{TaskStatus, TerminationReason};
use agentd_core::utils::constants::{
    EVENT_WORKFLOW_INPUT_RECEIVED, EVENT_WORKFLOW_RESULT_CANCELLED,
};

struct Harness {
    store: Arc<InMemoryTaskStore>,
    broadcaster: Arc<EventBroadcaster>,
    history: Arc<AsyncEventHistoryStore>,
    service: TaskExecutionService,
}

fn harness(executor: Arc<dyn AgentExecutor>, config: ExecutionConfig) -> Harness {
    let store = Arc::new(InMemoryTaskStore::new());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let history_inner = Arc::new(RecordingHistoryStore::new());
    let history = Arc::new(AsyncEventHistoryStore::new(history_inner));
    let service = TaskExecutionService::new(store.clone(), executor, config)
        .with_broadcaster(broadcaster.clone())
        .with_history(history.clone());
    Harness {
        store,
        broadcaster,
        history,
        service,
    }
}

fn request(description: &str, session: &str) -> ExecuteTaskRequest {
    ExecuteTaskRequest {
        description: description.to_string(),
        session_id: Some(session.to_string()),
        ..Default::default()
    }
}

async fn wait_terminal(store: &Arc<InMemoryTaskStore>, task_id: &str) {
    let store = store.clone();
    let task_id = task_id.to_string();
    wait_for(Duration::from_secs(5), move || {
        let store = store.clone();
        let task_id = task_id.clone();
        async move { store.get(&task_id).await.map(|t| t.is_terminal()).unwrap_or(false) }
    })
    .await;
}

/// Wait until the worker has fully torn down: terminal status and the
/// lease released.
async fn wait_settled(store: &Arc<InMemoryTaskStore>, task_id: &str) {
    let store = store.clone();
    let task_id = task_id.to_string();
    wait_for(Duration::from_secs(5), move || {
        let store = store.clone();
        let task_id = task_id.clone();
        async move {
            store
                .get(&task_id)
                .await
                .map(|t| t.is_terminal() && t.owner_id.is_none())
                .unwrap_or(false)
        }
    })
    .await;
}

// ---- Happy path ----

#[tokio::test]
async fn task_runs_to_completion_with_result_and_progress() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());

    let task = h
        .service
        .execute_task_async(request("summarize the report", "s1"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    wait_settled(&h.store, &task.task_id).await;
    let done = h.service.get_task(&task.task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.termination_reason, TerminationReason::Completed);
    let result = done.result.unwrap();
    assert_eq!(result.answer, "Echo: summarize the report");
    assert_eq!(done.total_tokens, 42);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    // Lease cleared on the way out.
    assert!(done.owner_id.is_none());

    // Progress was projected from the executor's events.
    assert_eq!(done.current_iteration, 1);
    assert_eq!(done.tokens_used, 42);

    assert_eq!(h.service.metrics().completed_tasks, 1);
}

#[tokio::test]
async fn replay_history_starts_with_the_users_request() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());

    let task = h
        .service
        .execute_task_async(request("count the stars", "s1"))
        .await
        .unwrap();
    wait_terminal(&h.store, &task.task_id).await;

    use agentd_core::history::EventHistoryStore;
    let records = h.history.stream("s1").await.unwrap();
    assert!(!records.is_empty());
    assert_eq!(records[0].event_type, EVENT_WORKFLOW_INPUT_RECEIVED);
    assert_eq!(records[0].run_id, task.task_id);
    assert_eq!(
        records[0].payload.as_ref().unwrap()["description"],
        "count the stars"
    );

    h.history.close().await.unwrap();
}

#[tokio::test]
async fn broadcaster_history_carries_executor_events() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    let task = h
        .service
        .execute_task_async(request("work", "s1"))
        .await
        .unwrap();
    wait_terminal(&h.store, &task.task_id).await;

    let types: Vec<String> = h
        .broadcaster
        .get_event_history("s1")
        .iter()
        .map(|e| e.event_type().to_string())
        .collect();
    assert_eq!(types[0], EVENT_WORKFLOW_INPUT_RECEIVED);
    assert!(types.contains(&"workflow.node.completed".to_string()));
}

// ---- Validation and collaborator gating ----

#[tokio::test]
async fn empty_description_is_rejected() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    let err = h
        .service
        .execute_task_async(request("   ", "s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn missing_broadcaster_is_unavailable() {
    let store = Arc::new(InMemoryTaskStore::new());
    let service = TaskExecutionService::new(
        store,
        Arc::new(EchoExecutor),
        ExecutionConfig::default(),
    );
    let err = service
        .execute_task_async(request("work", "s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Unavailable(_)));
}

#[tokio::test]
async fn a_session_id_is_minted_when_absent() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    let task = h
        .service
        .execute_task_async(ExecuteTaskRequest {
            description: "work".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!task.session_id.is_empty());
}

// ---- Failure paths ----

#[tokio::test]
async fn executor_error_marks_task_failed() {
    let h = harness(Arc::new(FailingExecutor), ExecutionConfig::default());
    let task = h
        .service
        .execute_task_async(request("work", "s1"))
        .await
        .unwrap();
    wait_settled(&h.store, &task.task_id).await;

    let failed = h.service.get_task(&task.task_id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.termination_reason, TerminationReason::Error);
    assert!(failed.error.unwrap().contains("model exploded"));
    assert_eq!(h.service.metrics().failed_tasks, 1);
}

#[tokio::test]
async fn executor_panic_is_recovered_into_the_record() {
    let h = harness(Arc::new(PanickingExecutor), ExecutionConfig::default());
    let task = h
        .service
        .execute_task_async(request("work", "s1"))
        .await
        .unwrap();
    wait_terminal(&h.store, &task.task_id).await;

    let failed = h.service.get_task(&task.task_id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    let error = failed.error.unwrap();
    assert!(error.starts_with("panic:"), "error was: {error}");
    assert!(error.contains("executor blew up"));
}

#[tokio::test]
async fn deadline_maps_to_timeout_reason() {
    let h = harness(Arc::new(DeadlineExecutor), ExecutionConfig::default());
    let task = h
        .service
        .execute_task_async(request("work", "s1"))
        .await
        .unwrap();
    wait_terminal(&h.store, &task.task_id).await;

    let timed_out = h.service.get_task(&task.task_id).await.unwrap();
    assert_eq!(timed_out.status, TaskStatus::Cancelled);
    assert_eq!(timed_out.termination_reason, TerminationReason::Timeout);
}

// ---- Admission ----

#[tokio::test]
async fn admission_timeout_leaves_a_failed_record() {
    let config = ExecutionConfig {
        admission_limit: 1,
        ..Default::default()
    };
    let h = harness(
        Arc::new(SlowExecutor {
            delay: Duration::from_secs(30),
        }),
        config,
    );

    // Occupy the only slot.
    let running = h
        .service
        .execute_task_async(request("occupy", "s-occupy"))
        .await
        .unwrap();

    // The next request cannot be admitted within 50ms.
    let err = h
        .service
        .execute_task_async(ExecuteTaskRequest {
            description: "starved".to_string(),
            session_id: Some("s-starved".to_string()),
            admission_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Unavailable(_)));

    // The record exists and reports the admission failure within 2s.
    let store = h.store.clone();
    wait_for(Duration::from_secs(2), move || {
        let store = store.clone();
        async move {
            store
                .list_by_session("s-starved")
                .await
                .unwrap()
                .first()
                .map(|t| {
                    t.status == TaskStatus::Failed
                        && t.error.as_deref() == Some("admission timed out")
                })
                .unwrap_or(false)
        }
    })
    .await;

    h.service.cancel_task(&running.task_id).await.unwrap();
}

// ---- Cancellation ----

#[tokio::test]
async fn cancel_running_task_emits_envelope_and_sets_reason() {
    let h = harness(
        Arc::new(SlowExecutor {
            delay: Duration::from_secs(30),
        }),
        ExecutionConfig::default(),
    );
    let task = h
        .service
        .execute_task_async(request("long haul", "s1"))
        .await
        .unwrap();

    // Wait for the worker to be mid-execution.
    let store = h.store.clone();
    let task_id = task.task_id.clone();
    wait_for(Duration::from_secs(2), move || {
        let store = store.clone();
        let task_id = task_id.clone();
        async move {
            store
                .get(&task_id)
                .await
                .map(|t| t.status == TaskStatus::Running)
                .unwrap_or(false)
        }
    })
    .await;

    h.service.cancel_task(&task.task_id).await.unwrap();
    wait_settled(&h.store, &task.task_id).await;

    let cancelled = h.service.get_task(&task.task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.termination_reason, TerminationReason::Cancelled);
    assert_eq!(h.service.metrics().cancelled_tasks, 1);

    let history = h.broadcaster.get_event_history("s1");
    assert!(history
        .iter()
        .any(|e| e.event_type() == EVENT_WORKFLOW_RESULT_CANCELLED));
}

#[tokio::test]
async fn cancel_terminal_task_is_a_conflict() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    let task = h
        .service
        .execute_task_async(request("quick", "s1"))
        .await
        .unwrap();
    wait_terminal(&h.store, &task.task_id).await;

    let err = h.service.cancel_task(&task.task_id).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn cancel_without_live_worker_synthesizes_the_status() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    // A task created directly in the store has no local worker.
    let task = h.store.create("s1", "orphaned", None, None).await.unwrap();

    h.service.cancel_task(&task.task_id).await.unwrap();

    let cancelled = h.store.get(&task.task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(cancelled.termination_reason, TerminationReason::Cancelled);
    let history = h.broadcaster.get_event_history("s1");
    assert!(history
        .iter()
        .any(|e| e.event_type() == EVENT_WORKFLOW_RESULT_CANCELLED));
}

#[tokio::test]
async fn cancel_unknown_task_is_not_found() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    assert!(matches!(
        h.service.cancel_task("ghost").await.unwrap_err(),
        CoreError::NotFound(_)
    ));
}

// ---- Lease loss ----

#[tokio::test]
async fn losing_the_lease_cancels_local_execution() {
    let config = ExecutionConfig {
        lease_renew_interval: Duration::from_millis(30),
        ..Default::default()
    };
    let h = harness(
        Arc::new(SlowExecutor {
            delay: Duration::from_secs(30),
        }),
        config,
    );
    let task = h
        .service
        .execute_task_async(request("contended", "s1"))
        .await
        .unwrap();

    // Another process takes the lease over.
    h.store
        .release_task_lease(&task.task_id, h.service.owner_id())
        .await
        .unwrap();
    let far = Utc::now() + chrono::Duration::hours(1);
    assert!(h
        .store
        .try_claim_task(&task.task_id, "intruder-proc", far)
        .await
        .unwrap());

    // The next renewal fails and the local execution is cancelled.
    wait_terminal(&h.store, &task.task_id).await;
    let lost = h.service.get_task(&task.task_id).await.unwrap();
    assert_eq!(lost.status, TaskStatus::Cancelled);
    assert_eq!(lost.termination_reason, TerminationReason::Cancelled);
    // The intruder's lease is untouched by this process's release.
    assert_eq!(lost.owner_id.as_deref(), Some("intruder-proc"));
}

// ---- Resumption ----

#[tokio::test]
async fn resume_on_empty_store_returns_zero() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    assert_eq!(h.service.resume_pending_tasks().await.unwrap(), 0);
}

#[tokio::test]
async fn resume_respawns_claimable_tasks() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());

    // Two tasks left behind by a dead process, one of them mid-run.
    let a = h.store.create("s1", "leftover a", None, None).await.unwrap();
    let b = h.store.create("s2", "leftover b", None, None).await.unwrap();
    h.store.set_status(&b.task_id, TaskStatus::Running).await.unwrap();

    let resumed = h.service.resume_pending_tasks().await.unwrap();
    assert_eq!(resumed, 2);

    wait_terminal(&h.store, &a.task_id).await;
    wait_terminal(&h.store, &b.task_id).await;
    assert_eq!(
        h.store.get(&a.task_id).await.unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(
        h.store.get(&b.task_id).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn resume_skips_tasks_with_foreign_leases() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    let task = h.store.create("s1", "still owned", None, None).await.unwrap();
    let far = Utc::now() + chrono::Duration::hours(1);
    h.store
        .try_claim_task(&task.task_id, "live-proc", far)
        .await
        .unwrap();

    assert_eq!(h.service.resume_pending_tasks().await.unwrap(), 0);
    assert_eq!(
        h.store.get(&task.task_id).await.unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn resume_releases_leases_of_invalid_tasks() {
    let h = harness(Arc::new(EchoExecutor), ExecutionConfig::default());
    // An empty description cannot be re-executed.
    let task = h.store.create("s1", "", None, None).await.unwrap();

    assert_eq!(h.service.resume_pending_tasks().await.unwrap(), 0);
    let skipped = h.store.get(&task.task_id).await.unwrap();
    assert!(skipped.owner_id.is_none(), "lease must be released");
}

// ---- Listings & stats ----

#[tokio::test]
async fn active_listing_and_stats_follow_the_lifecycle() {
    let h = harness(
        Arc::new(SlowExecutor {
            delay: Duration::from_secs(30),
        }),
        ExecutionConfig::default(),
    );
    let task = h
        .service
        .execute_task_async(request("work", "s1"))
        .await
        .unwrap();

    let store = h.store.clone();
    let task_id = task.task_id.clone();
    wait_for(Duration::from_secs(2), move || {
        let store = store.clone();
        let task_id = task_id.clone();
        async move {
            store
                .get(&task_id)
                .await
                .map(|t| t.status == TaskStatus::Running)
                .unwrap_or(false)
        }
    })
    .await;

    let active = h.service.list_active_tasks().await.unwrap();
    assert_eq!(active.len(), 1);
    let stats = h.service.get_task_stats().await.unwrap();
    assert_eq!(stats.running, 1);
    assert_eq!(h.service.metrics().active_tasks, 1);

    h.service.cancel_task(&task.task_id).await.unwrap();
    wait_terminal(&h.store, &task.task_id).await;
    assert!(h.service.list_active_tasks().await.unwrap().is_empty());
}
