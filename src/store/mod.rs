//! Task store — persistence layer for orchestrated tasks.
//!
//! The task store is responsible for the task map, the status transition
//! rules, and the lease primitives that give one process exclusive
//! execution rights under horizontal scale. The [`InMemoryTaskStore`] is
//! the provided implementation, with optional atomic-rename file
//! persistence; production deployments can implement [`TaskStore`] backed
//! by a database.

mod memory;

pub use memory::{InMemoryTaskStore, TaskStoreConfig};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::types::{Task, TaskResult, TaskStatus, TerminationReason};

/// Per-session aggregate returned by
/// [`TaskStore::summarize_session_tasks`].
#[derive(Debug, Clone, Default)]
pub struct SessionTaskSummary {
    /// Number of tasks belonging to the session.
    pub task_count: usize,

    /// The session's newest task by `created_at`, ties broken by the
    /// larger task id.
    pub last_task: Option<Task>,
}

/// Aggregate task counts returned by the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    /// Total tasks in the store.
    pub total: usize,
    /// Tasks awaiting execution.
    pub pending: usize,
    /// Tasks currently executing.
    pub running: usize,
    /// Tasks that completed with a result.
    pub completed: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// Tasks that were cancelled.
    pub cancelled: usize,
}

/// Trait for persisting and retrieving tasks.
///
/// Every operation is logically atomic under the store's internal lock
/// and returns copies so callers never alias stored records. Listings are
/// ordered by `created_at` descending.
///
/// Status invariants enforced by implementations:
/// - a task is terminal iff `completed_at` is set;
/// - `termination_reason` is `None` iff the status is non-terminal;
/// - terminal tasks reject further transitions with `Conflict`;
/// - at most one unexpired `(owner_id, lease_until)` pair exists per task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a fresh `pending` task with a generated id.
    async fn create(
        &self,
        session_id: &str,
        description: &str,
        agent_preset: Option<String>,
        tool_preset: Option<String>,
    ) -> CoreResult<Task>;

    /// Create a fresh `pending` task under a caller-provided id.
    ///
    /// Used when the id was minted before creation (the input-received
    /// event precedes the record). Fails with `Conflict` if the id is
    /// taken.
    async fn create_with_id(
        &self,
        task_id: &str,
        session_id: &str,
        description: &str,
        agent_preset: Option<String>,
        tool_preset: Option<String>,
    ) -> CoreResult<Task>;

    /// Retrieve a copy of a task, or `NotFound`.
    async fn get(&self, task_id: &str) -> CoreResult<Task>;

    /// Replace an existing task record. Fails with `NotFound` if the id
    /// is unknown.
    async fn update(&self, task: Task) -> CoreResult<()>;

    /// List tasks ordered by `created_at` descending.
    async fn list(&self, limit: usize, offset: usize) -> CoreResult<Vec<Task>>;

    /// List a session's tasks, newest first.
    async fn list_by_session(&self, session_id: &str) -> CoreResult<Vec<Task>>;

    /// List tasks whose status is in `statuses`, newest first.
    async fn list_by_status(&self, statuses: &[TaskStatus]) -> CoreResult<Vec<Task>>;

    /// Summarize the given sessions: task count plus the newest task.
    async fn summarize_session_tasks(
        &self,
        session_ids: &[String],
    ) -> CoreResult<HashMap<String, SessionTaskSummary>>;

    /// Delete a task. Fails with `NotFound` if the id is unknown.
    async fn delete(&self, task_id: &str) -> CoreResult<()>;

    /// Transition a task's status, auto-setting `started_at`,
    /// `completed_at` and `termination_reason` per the transition rules.
    async fn set_status(&self, task_id: &str, status: TaskStatus) -> CoreResult<Task>;

    /// Transition to a terminal status with an explicit termination
    /// reason (used to distinguish `timeout` from plain cancellation).
    async fn set_status_with_reason(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: TerminationReason,
    ) -> CoreResult<Task>;

    /// Force the task into `failed` with `termination_reason = error`.
    async fn set_error(&self, task_id: &str, error: &str) -> CoreResult<Task>;

    /// Record the final result, forcing `completed` /
    /// `termination_reason = completed` and the final totals. The
    /// result's session id fills an empty `session_id` on the record.
    async fn set_result(&self, task_id: &str, result: TaskResult) -> CoreResult<Task>;

    /// Overwrite the progress counters.
    async fn update_progress(&self, task_id: &str, iteration: u32, tokens: u64) -> CoreResult<()>;

    /// Claim execution rights for `owner` until `until`.
    ///
    /// Succeeds iff the task has no active lease, the active lease
    /// already belongs to `owner`, or the lease has expired. Returns
    /// whether the claim took effect.
    async fn try_claim_task(
        &self,
        task_id: &str,
        owner: &str,
        until: DateTime<Utc>,
    ) -> CoreResult<bool>;

    /// Extend the lease. Succeeds iff the current owner matches.
    async fn renew_task_lease(
        &self,
        task_id: &str,
        owner: &str,
        until: DateTime<Utc>,
    ) -> CoreResult<bool>;

    /// Clear the lease iff the owner matches; no-op otherwise.
    async fn release_task_lease(&self, task_id: &str, owner: &str) -> CoreResult<()>;

    /// Atomically select up to `batch_size` tasks whose status is in
    /// `statuses` and whose lease is free or expired, claim each for
    /// `owner`, and return copies.
    async fn claim_resumable_tasks(
        &self,
        owner: &str,
        until: DateTime<Utc>,
        batch_size: usize,
        statuses: &[TaskStatus],
    ) -> CoreResult<Vec<Task>>;

    /// Aggregate task counts by status.
    async fn stats(&self) -> CoreResult<TaskStats>;
}
