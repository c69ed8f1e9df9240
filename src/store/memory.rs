//! In-memory task store with optional atomic-rename file persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{Task, TaskResult, TaskStatus, TerminationReason};

use super::{SessionTaskSummary, TaskStats, TaskStore};

/// On-disk version of the task persistence file.
const PERSIST_VERSION: u32 = 1;

/// How often the eviction loop fires.
const EVICTION_INTERVAL: Duration = Duration::from_secs(300);

/// Configuration for [`InMemoryTaskStore`].
#[derive(Debug, Clone)]
pub struct TaskStoreConfig {
    /// How long terminal tasks are retained after completion.
    pub retention: chrono::Duration,

    /// Hard cap on stored tasks. Exceeding it evicts the oldest terminal
    /// tasks by `completed_at`.
    pub max_tasks: usize,

    /// Optional persistence path. When set, every mutating operation
    /// rewrites the full task map via write-temp-then-rename.
    pub persist_path: Option<PathBuf>,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::hours(24),
            max_tasks: 10_000,
            persist_path: None,
        }
    }
}

/// Serialized form of the task map.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedTasks {
    version: u32,
    tasks: Vec<Task>,
}

/// In-memory task store backed by a `HashMap` under a single mutex.
///
/// All operations are atomic under the lock and return copies. With a
/// persistence path configured, the full map is serialized to
/// `<path>.tmp` and renamed over `<path>` after every mutation;
/// persistence failures are logged and never fail the caller.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
    config: TaskStoreConfig,
}

impl InMemoryTaskStore {
    /// Create a new empty store with default configuration and no
    /// persistence.
    pub fn new() -> Self {
        Self::with_config(TaskStoreConfig::default())
    }

    /// Create a new empty store with the given configuration.
    ///
    /// Does not attempt to load the persistence file; use
    /// [`InMemoryTaskStore::load`] when rehydrating across restarts.
    pub fn with_config(config: TaskStoreConfig) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Create a store and load any previously persisted tasks.
    ///
    /// Invalid or missing content is logged and treated as an empty
    /// store; loading is never fatal.
    pub async fn load(config: TaskStoreConfig) -> Self {
        let store = Self::with_config(config);
        if let Some(path) = store.config.persist_path.clone() {
            let loaded = match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<PersistedTasks>(&bytes) {
                    Ok(persisted) => persisted.tasks,
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Ignoring invalid task persistence file");
                        Vec::new()
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to read task persistence file");
                    Vec::new()
                }
            };

            if !loaded.is_empty() {
                let mut tasks = store.tasks.lock().await;
                for task in loaded {
                    tasks.insert(task.task_id.clone(), task);
                }
                info!(count = tasks.len(), path = ?path, "Loaded persisted tasks");
            }
        }
        store
    }

    /// Spawn the background eviction loop (fires every 5 minutes).
    pub fn spawn_eviction_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = store.evict_once(Utc::now()).await;
                if evicted > 0 {
                    debug!(evicted, "Task eviction pass complete");
                }
            }
        })
    }

    /// Run one eviction pass at the given instant; returns how many
    /// tasks were removed.
    ///
    /// Pass 1 removes terminal tasks older than the retention window.
    /// Pass 2 enforces the `max_tasks` cap by deleting the
    /// oldest-by-`completed_at` terminal tasks. Running and pending
    /// tasks are never evicted by age.
    pub async fn evict_once(&self, now: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();

        tasks.retain(|_, task| {
            if !task.is_terminal() {
                return true;
            }
            match task.completed_at {
                Some(done) => now - done <= self.config.retention,
                // Terminal without completed_at should not occur; keep it
                // rather than guessing its age.
                None => true,
            }
        });

        if tasks.len() > self.config.max_tasks {
            let excess = tasks.len() - self.config.max_tasks;
            let mut terminal: Vec<(String, DateTime<Utc>)> = tasks
                .values()
                .filter(|t| t.is_terminal())
                .map(|t| (t.task_id.clone(), t.completed_at.unwrap_or(t.created_at)))
                .collect();
            terminal.sort_by_key(|(_, done)| *done);
            for (task_id, _) in terminal.into_iter().take(excess) {
                tasks.remove(&task_id);
            }
        }

        let evicted = before - tasks.len();
        if evicted > 0 {
            self.persist(&tasks).await;
        }
        evicted
    }

    /// Serialize the full map to the configured path via
    /// write-temp-then-rename. Failures are logged at warn level.
    async fn persist(&self, tasks: &HashMap<String, Task>) {
        let Some(ref path) = self.config.persist_path else {
            return;
        };

        let snapshot = PersistedTasks {
            version: PERSIST_VERSION,
            tasks: tasks.values().cloned().collect(),
        };
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialize task map");
                return;
            }
        };

        let tmp = path.with_extension("json.tmp");
        if let Err(e) = fs::write(&tmp, &bytes).await {
            warn!(path = ?tmp, error = %e, "Failed to write task persistence temp file");
            return;
        }
        if let Err(e) = fs::rename(&tmp, path).await {
            warn!(path = ?path, error = %e, "Failed to rename task persistence file");
        }
    }

    fn sorted_desc(mut tasks: Vec<Task>) -> Vec<Task> {
        // Newest first; equal timestamps break toward the larger id so
        // listings are deterministic.
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        tasks
    }

    /// Apply the status transition rules to a task in place.
    fn apply_status(
        task: &mut Task,
        status: TaskStatus,
        reason: Option<TerminationReason>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if task.is_terminal() {
            return Err(CoreError::conflict(format!(
                "task {} already terminal ({})",
                task.task_id, task.status
            )));
        }

        task.status = status;
        if status == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            if task.completed_at.is_none() {
                task.completed_at = Some(now);
            }
            task.termination_reason = reason.unwrap_or(match status {
                TaskStatus::Completed => TerminationReason::Completed,
                TaskStatus::Cancelled => TerminationReason::Cancelled,
                TaskStatus::Failed => TerminationReason::Error,
                _ => unreachable!(),
            });
        } else {
            task.termination_reason = TerminationReason::None;
        }
        Ok(())
    }

    fn build_task(
        task_id: String,
        session_id: &str,
        description: &str,
        agent_preset: Option<String>,
        tool_preset: Option<String>,
    ) -> Task {
        let mut task = Task::new(task_id, session_id);
        task.description = description.to_string();
        task.agent_preset = agent_preset;
        task.tool_preset = tool_preset;
        task
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(
        &self,
        session_id: &str,
        description: &str,
        agent_preset: Option<String>,
        tool_preset: Option<String>,
    ) -> CoreResult<Task> {
        let task_id = Uuid::new_v4().to_string();
        self.create_with_id(&task_id, session_id, description, agent_preset, tool_preset)
            .await
    }

    async fn create_with_id(
        &self,
        task_id: &str,
        session_id: &str,
        description: &str,
        agent_preset: Option<String>,
        tool_preset: Option<String>,
    ) -> CoreResult<Task> {
        if session_id.is_empty() {
            return Err(CoreError::validation("session id must not be empty"));
        }

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(task_id) {
            return Err(CoreError::conflict(format!("task {} already exists", task_id)));
        }

        let task = Self::build_task(
            task_id.to_string(),
            session_id,
            description,
            agent_preset,
            tool_preset,
        );
        tasks.insert(task.task_id.clone(), task.clone());
        debug!(task_id = %task.task_id, session_id = %session_id, "Task created");
        self.persist(&tasks).await;
        Ok(task)
    }

    async fn get(&self, task_id: &str) -> CoreResult<Task> {
        let tasks = self.tasks.lock().await;
        tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))
    }

    async fn update(&self, task: Task) -> CoreResult<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.contains_key(&task.task_id) {
            return Err(CoreError::not_found(format!("task {}", task.task_id)));
        }
        debug!(task_id = %task.task_id, status = %task.status, "Task updated");
        tasks.insert(task.task_id.clone(), task);
        self.persist(&tasks).await;
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> CoreResult<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        let all = Self::sorted_desc(tasks.values().cloned().collect());
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_by_session(&self, session_id: &str) -> CoreResult<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(Self::sorted_desc(
            tasks
                .values()
                .filter(|t| t.session_id == session_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_by_status(&self, statuses: &[TaskStatus]) -> CoreResult<Vec<Task>> {
        let tasks = self.tasks.lock().await;
        Ok(Self::sorted_desc(
            tasks
                .values()
                .filter(|t| statuses.contains(&t.status))
                .cloned()
                .collect(),
        ))
    }

    async fn summarize_session_tasks(
        &self,
        session_ids: &[String],
    ) -> CoreResult<HashMap<String, SessionTaskSummary>> {
        let tasks = self.tasks.lock().await;
        let mut summaries: HashMap<String, SessionTaskSummary> = session_ids
            .iter()
            .map(|id| (id.clone(), SessionTaskSummary::default()))
            .collect();

        for task in tasks.values() {
            let Some(summary) = summaries.get_mut(&task.session_id) else {
                continue;
            };
            summary.task_count += 1;
            let newer = match &summary.last_task {
                None => true,
                Some(last) => {
                    task.created_at > last.created_at
                        || (task.created_at == last.created_at && task.task_id > last.task_id)
                }
            };
            if newer {
                summary.last_task = Some(task.clone());
            }
        }
        Ok(summaries)
    }

    async fn delete(&self, task_id: &str) -> CoreResult<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.remove(task_id).is_none() {
            return Err(CoreError::not_found(format!("task {}", task_id)));
        }
        debug!(task_id = %task_id, "Task deleted");
        self.persist(&tasks).await;
        Ok(())
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) -> CoreResult<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))?;
        Self::apply_status(task, status, None, Utc::now())?;
        let copy = task.clone();
        debug!(task_id = %task_id, status = %status, "Task status set");
        self.persist(&tasks).await;
        Ok(copy)
    }

    async fn set_status_with_reason(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: TerminationReason,
    ) -> CoreResult<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))?;
        Self::apply_status(task, status, Some(reason), Utc::now())?;
        let copy = task.clone();
        debug!(task_id = %task_id, status = %status, reason = %reason, "Task status set");
        self.persist(&tasks).await;
        Ok(copy)
    }

    async fn set_error(&self, task_id: &str, error: &str) -> CoreResult<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))?;
        Self::apply_status(
            task,
            TaskStatus::Failed,
            Some(TerminationReason::Error),
            Utc::now(),
        )?;
        task.error = Some(error.to_string());
        let copy = task.clone();
        warn!(task_id = %task_id, error = %error, "Task failed");
        self.persist(&tasks).await;
        Ok(copy)
    }

    async fn set_result(&self, task_id: &str, result: TaskResult) -> CoreResult<Task> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))?;
        Self::apply_status(
            task,
            TaskStatus::Completed,
            Some(TerminationReason::Completed),
            Utc::now(),
        )?;
        task.total_iterations = result.iterations;
        task.total_tokens = result.total_tokens;
        if task.session_id.is_empty() {
            task.session_id = result.session_id.clone();
        }
        task.result = Some(result);
        let copy = task.clone();
        info!(task_id = %task_id, "Task completed");
        self.persist(&tasks).await;
        Ok(copy)
    }

    async fn update_progress(&self, task_id: &str, iteration: u32, tokens: u64) -> CoreResult<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))?;
        task.current_iteration = iteration;
        task.tokens_used = tokens;
        self.persist(&tasks).await;
        Ok(())
    }

    async fn try_claim_task(
        &self,
        task_id: &str,
        owner: &str,
        until: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))?;

        let now = Utc::now();
        let claimable = !task.has_active_lease(now) || task.owner_id.as_deref() == Some(owner);
        if claimable {
            task.owner_id = Some(owner.to_string());
            task.lease_until = Some(until);
            debug!(task_id = %task_id, owner = %owner, "Task lease claimed");
            self.persist(&tasks).await;
        }
        Ok(claimable)
    }

    async fn renew_task_lease(
        &self,
        task_id: &str,
        owner: &str,
        until: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {}", task_id)))?;

        if task.owner_id.as_deref() != Some(owner) {
            return Ok(false);
        }
        task.lease_until = Some(until);
        self.persist(&tasks).await;
        Ok(true)
    }

    async fn release_task_lease(&self, task_id: &str, owner: &str) -> CoreResult<()> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else {
            // Released after eviction; nothing to do.
            return Ok(());
        };
        if task.owner_id.as_deref() == Some(owner) {
            task.owner_id = None;
            task.lease_until = None;
            debug!(task_id = %task_id, owner = %owner, "Task lease released");
            self.persist(&tasks).await;
        }
        Ok(())
    }

    async fn claim_resumable_tasks(
        &self,
        owner: &str,
        until: DateTime<Utc>,
        batch_size: usize,
        statuses: &[TaskStatus],
    ) -> CoreResult<Vec<Task>> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<String> = tasks
            .values()
            .filter(|t| statuses.contains(&t.status) && !t.has_active_lease(now))
            .map(|t| t.task_id.clone())
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for task_id in candidates {
            if let Some(task) = tasks.get_mut(&task_id) {
                task.owner_id = Some(owner.to_string());
                task.lease_until = Some(until);
                claimed.push(task.clone());
            }
        }
        if !claimed.is_empty() {
            info!(owner = %owner, count = claimed.len(), "Claimed resumable tasks");
            self.persist(&tasks).await;
        }
        Ok(claimed)
    }

    async fn stats(&self) -> CoreResult<TaskStats> {
        let tasks = self.tasks.lock().await;
        let mut stats = TaskStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }
}
