//! Task execution service — the top-level orchestrator.
//!
//! Admission-controlled asynchronous execution of tasks with per-process
//! leases, cancellation, progress tracking, and crash-recovery
//! resumption. The agent executor is an injected dependency; events flow
//! from it through the listener chain (broadcaster, progress tracker,
//! history sink).

mod orphan;
mod progress;

pub use orphan::{BridgeOrphanResumer, OrphanAction, OrphanResumeResult};
pub use progress::TaskProgressTracker;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::events::{EventBroadcaster, EventListener, MultiEventListener};
use crate::history::AsyncEventHistoryStore;
use crate::store::{TaskStats, TaskStore};
use crate::types::{AgentEvent, Attachment, EventMeta, Task, TaskResult, TaskStatus, TerminationReason};
use crate::utils::constants::{EVENT_WORKFLOW_INPUT_RECEIVED, EVENT_WORKFLOW_RESULT_CANCELLED};
use crate::utils::sanitize::{sanitize_attachments, sanitize_event};

// ---------------------------------------------------------------------------
// Injected collaborators
// ---------------------------------------------------------------------------

/// Everything an agent executor needs to run one task.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The task being executed (also the run id on emitted events).
    pub task_id: String,

    /// The owning session.
    pub session_id: String,

    /// The natural-language task.
    pub description: String,

    /// Agent preset installed for this execution.
    pub agent_preset: Option<String>,

    /// Tool preset installed for this execution.
    pub tool_preset: Option<String>,

    /// Cancelled when the task is cancelled, times out, or loses its
    /// lease. Executors should observe it at every suspension point.
    pub cancel: CancellationToken,
}

/// The external subsystem that actually runs the LLM workflow.
///
/// Implementations emit workflow events through the listener and return
/// the final result. Long-running by nature; this call is the real
/// source of latency in the system.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run the task to completion, streaming events via `listener`.
    async fn execute_task(
        &self,
        context: ExecutionContext,
        listener: Arc<dyn EventListener>,
    ) -> CoreResult<TaskResult>;
}

/// A single analytics record emitted at task milestones.
#[derive(Debug, Clone)]
pub struct AnalyticsEvent {
    /// Event name, e.g. `task_completed`.
    pub name: String,
    /// The task concerned.
    pub task_id: String,
    /// The owning session.
    pub session_id: String,
    /// Free-form properties.
    pub properties: Map<String, Value>,
}

/// Injected analytics client. Failures are logged, never propagated.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Record one analytics event.
    async fn track(&self, event: AnalyticsEvent) -> CoreResult<()>;
}

// ---------------------------------------------------------------------------
// Configuration, metrics, cancellation registry
// ---------------------------------------------------------------------------

/// Configuration for [`TaskExecutionService`].
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// This process's identity for lease ownership.
    pub owner_id: String,

    /// Global cap on in-flight tasks.
    pub admission_limit: usize,

    /// Default wait for an admission slot.
    pub admission_timeout: Duration,

    /// Lease duration granted on claim and renewal.
    pub lease_ttl: Duration,

    /// How often the lease renewer fires.
    pub lease_renew_interval: Duration,

    /// How many resumable tasks one recovery sweep claims.
    pub resume_batch_size: usize,

    /// Working directory handed to the orphan bridge resumer.
    pub orphan_work_dir: Option<PathBuf>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("proc-{}", Uuid::new_v4()),
            admission_limit: 64,
            admission_timeout: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(45),
            lease_renew_interval: Duration::from_secs(15),
            resume_batch_size: 32,
            orphan_work_dir: None,
        }
    }
}

/// Request parameters for [`TaskExecutionService::execute_task_async`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteTaskRequest {
    /// The natural-language task. Required.
    pub description: String,

    /// Owning session; a fresh one is minted when absent.
    pub session_id: Option<String>,

    /// Agent preset to install.
    pub agent_preset: Option<String>,

    /// Tool preset to install.
    pub tool_preset: Option<String>,

    /// Parent task for subtasks.
    pub parent_task_id: Option<String>,

    /// Attachments accompanying the request; sanitized before they reach
    /// event history.
    pub attachments: Vec<Attachment>,

    /// Per-request override of the admission wait.
    pub admission_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    active_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    cancelled_tasks: AtomicU64,
    total_execution_ms: AtomicU64,
}

/// Snapshot of the service's execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionMetrics {
    /// Tasks currently mid-execution in this process.
    pub active_tasks: u64,
    /// Tasks that finished with a result.
    pub completed_tasks: u64,
    /// Tasks that finished with an error.
    pub failed_tasks: u64,
    /// Tasks cancelled or timed out.
    pub cancelled_tasks: u64,
    /// Cumulative wall-clock execution time.
    pub total_execution_ms: u64,
}

/// Why a task's cancellation token was fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelCause {
    UserRequested,
    LeaseLost,
    DeadlineExceeded,
}

impl CancelCause {
    fn termination_reason(self) -> TerminationReason {
        match self {
            CancelCause::DeadlineExceeded => TerminationReason::Timeout,
            _ => TerminationReason::Cancelled,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            CancelCause::UserRequested => "cancelled by user",
            CancelCause::LeaseLost => "task lease lost",
            CancelCause::DeadlineExceeded => "deadline exceeded",
        }
    }
}

#[derive(Clone)]
struct CancelHandle {
    token: CancellationToken,
    cause: Arc<Mutex<Option<CancelCause>>>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(Mutex::new(None)),
        }
    }

    fn cancel(&self, cause: CancelCause) {
        {
            let mut slot = self.cause.lock().expect("cancel cause lock poisoned");
            slot.get_or_insert(cause);
        }
        self.token.cancel();
    }

    fn cause(&self) -> Option<CancelCause> {
        *self.cause.lock().expect("cancel cause lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// History sink listener
// ---------------------------------------------------------------------------

/// Listener that writes sanitized events into the async history store.
pub struct HistoryEventListener {
    history: Arc<AsyncEventHistoryStore>,
}

impl HistoryEventListener {
    /// Wrap the given store.
    pub fn new(history: Arc<AsyncEventHistoryStore>) -> Self {
        Self { history }
    }
}

#[async_trait]
impl EventListener for HistoryEventListener {
    async fn on_event(&self, event: &AgentEvent) {
        use crate::history::EventHistoryStore;
        let sanitized = sanitize_event(event);
        if let Err(e) = self.history.append(&sanitized).await {
            warn!(event_type = %event.event_type(), error = %e, "Event not recorded to history");
        }
    }
}

// ---------------------------------------------------------------------------
// TaskExecutionService
// ---------------------------------------------------------------------------

/// The orchestrator: admits, claims, executes, observes and resumes
/// tasks. Construct once at process start-up with its collaborators and
/// share by cloning (all state is behind `Arc`s).
#[derive(Clone)]
pub struct TaskExecutionService {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn AgentExecutor>,
    broadcaster: Option<Arc<EventBroadcaster>>,
    history: Option<Arc<AsyncEventHistoryStore>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    orphan_resumer: Option<Arc<dyn BridgeOrphanResumer>>,
    progress: Arc<TaskProgressTracker>,
    admission: Arc<Semaphore>,
    cancels: Arc<Mutex<HashMap<String, CancelHandle>>>,
    metrics: Arc<MetricsInner>,
    seq: Arc<AtomicU64>,
    config: Arc<ExecutionConfig>,
}

impl TaskExecutionService {
    /// Create a service over the given store and executor.
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn AgentExecutor>,
        config: ExecutionConfig,
    ) -> Self {
        let progress = Arc::new(TaskProgressTracker::new(Arc::clone(&store)));
        let admission = Arc::new(Semaphore::new(config.admission_limit));
        Self {
            store,
            executor,
            broadcaster: None,
            history: None,
            analytics: None,
            orphan_resumer: None,
            progress,
            admission,
            cancels: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(MetricsInner::default()),
            seq: Arc::new(AtomicU64::new(0)),
            config: Arc::new(config),
        }
    }

    /// Attach the event broadcaster. Required before executing tasks.
    pub fn with_broadcaster(mut self, broadcaster: Arc<EventBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Attach the write-behind event history store.
    pub fn with_history(mut self, history: Arc<AsyncEventHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Attach an analytics sink.
    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    /// Attach the orphan bridge resumer used during start-up recovery.
    pub fn with_orphan_resumer(mut self, resumer: Arc<dyn BridgeOrphanResumer>) -> Self {
        self.orphan_resumer = Some(resumer);
        self
    }

    /// This process's lease owner id.
    pub fn owner_id(&self) -> &str {
        &self.config.owner_id
    }

    /// Current execution counters.
    pub fn metrics(&self) -> ExecutionMetrics {
        ExecutionMetrics {
            active_tasks: self.metrics.active_tasks.load(Ordering::Relaxed),
            completed_tasks: self.metrics.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.metrics.failed_tasks.load(Ordering::Relaxed),
            cancelled_tasks: self.metrics.cancelled_tasks.load(Ordering::Relaxed),
            total_execution_ms: self.metrics.total_execution_ms.load(Ordering::Relaxed),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// The listener chain handed to the executor: broadcaster, progress
    /// tracker, history sink — whichever are configured.
    fn listener(&self) -> Arc<dyn EventListener> {
        Arc::new(MultiEventListener::new(vec![
            self.broadcaster
                .clone()
                .map(|b| b as Arc<dyn EventListener>),
            Some(Arc::clone(&self.progress) as Arc<dyn EventListener>),
            self.history
                .clone()
                .map(|h| Arc::new(HistoryEventListener::new(h)) as Arc<dyn EventListener>),
        ]))
    }

    fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(45))
    }

    async fn record_analytics(&self, name: &str, task_id: &str, session_id: &str, properties: Map<String, Value>) {
        let Some(analytics) = &self.analytics else {
            return;
        };
        let event = AnalyticsEvent {
            name: name.to_string(),
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            properties,
        };
        if let Err(e) = analytics.track(event).await {
            warn!(event = %name, error = %e, "Analytics record failed");
        }
    }

    async fn emit(&self, event: &AgentEvent) {
        self.listener().on_event(event).await;
    }

    // -- Public API ---------------------------------------------------------

    /// Admit, claim and spawn an asynchronous execution of `request`.
    ///
    /// Emits `workflow.input.received` before the task record exists so
    /// replay history starts with the user's request, then creates the
    /// `pending` record and returns it once the background worker is
    /// spawned. On admission timeout the record is left `failed` and
    /// `Unavailable` is returned.
    pub async fn execute_task_async(&self, request: ExecuteTaskRequest) -> CoreResult<Task> {
        if self.broadcaster.is_none() {
            return Err(CoreError::unavailable("event broadcaster not configured"));
        }
        let description = request.description.trim().to_string();
        if description.is_empty() {
            return Err(CoreError::validation("task description must not be empty"));
        }

        let session_id = match request.session_id {
            Some(ref sid) if !sid.is_empty() => sid.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        let task_id = Uuid::new_v4().to_string();

        // History for this run starts with the user's request.
        let mut payload = Map::new();
        payload.insert("description".to_string(), Value::String(description.clone()));
        let attachments = sanitize_attachments(&request.attachments);
        if !attachments.is_empty() {
            payload.insert(
                "attachments".to_string(),
                serde_json::to_value(&attachments)?,
            );
        }
        self.emit(&AgentEvent::envelope(
            EventMeta::new(
                EVENT_WORKFLOW_INPUT_RECEIVED,
                &session_id,
                &task_id,
                self.next_seq(),
            ),
            payload,
        ))
        .await;

        let mut task = self
            .store
            .create_with_id(
                &task_id,
                &session_id,
                &description,
                request.agent_preset.clone(),
                request.tool_preset.clone(),
            )
            .await?;
        if let Some(parent) = request.parent_task_id.clone() {
            task.parent_task_id = Some(parent);
            self.store.update(task.clone()).await?;
        }

        // Admission: bounded, cancellable wait for a slot.
        let wait = request
            .admission_timeout
            .unwrap_or(self.config.admission_timeout);
        let permit = match tokio::time::timeout(
            wait,
            Arc::clone(&self.admission).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                let _ = self.store.set_error(&task_id, "admission gate closed").await;
                return Err(CoreError::unavailable("admission gate closed"));
            }
            Err(_elapsed) => {
                if let Err(e) = self.store.set_error(&task_id, "admission timed out").await {
                    warn!(task_id = %task_id, error = %e, "Failed to record admission timeout");
                }
                return Err(CoreError::unavailable("admission timed out"));
            }
        };

        // Single-writer ownership before the worker exists.
        let until = Utc::now() + self.lease_ttl();
        if !self
            .store
            .try_claim_task(&task_id, &self.config.owner_id, until)
            .await?
        {
            return Err(CoreError::conflict(format!(
                "task {} is leased to another process",
                task_id
            )));
        }

        let handle = CancelHandle::new();
        self.cancels
            .lock()
            .expect("cancel registry lock poisoned")
            .insert(task_id.clone(), handle.clone());

        self.spawn_worker(task.clone(), handle, permit);
        Ok(task)
    }

    /// Cancel a non-terminal task.
    ///
    /// With a live local worker, fires its cancellation token with a
    /// user-requested cause; without one (post-restart, pre-resumption)
    /// the cancelled status is synthesized directly.
    pub async fn cancel_task(&self, task_id: &str) -> CoreResult<()> {
        let task = self.store.get(task_id).await?;
        if task.is_terminal() {
            return Err(CoreError::conflict(format!(
                "task {} already terminal ({})",
                task_id, task.status
            )));
        }

        let handle = {
            let cancels = self.cancels.lock().expect("cancel registry lock poisoned");
            cancels.get(task_id).cloned()
        };

        match handle {
            Some(handle) => {
                info!(task_id = %task_id, "Cancelling running task");
                handle.cancel(CancelCause::UserRequested);
            }
            None => {
                info!(task_id = %task_id, "Cancelling task without live worker");
                self.store
                    .set_status_with_reason(task_id, TaskStatus::Cancelled, TerminationReason::Cancelled)
                    .await?;
                self.emit(&self.cancellation_event(
                    &task.session_id,
                    task_id,
                    TerminationReason::Cancelled,
                    CancelCause::UserRequested.describe(),
                ))
                .await;
            }
        }
        Ok(())
    }

    /// Fetch one task.
    pub async fn get_task(&self, task_id: &str) -> CoreResult<Task> {
        self.store.get(task_id).await
    }

    /// List tasks, newest first.
    pub async fn list_tasks(&self, limit: usize, offset: usize) -> CoreResult<Vec<Task>> {
        self.store.list(limit, offset).await
    }

    /// List a session's tasks, newest first.
    pub async fn list_session_tasks(&self, session_id: &str) -> CoreResult<Vec<Task>> {
        self.store.list_by_session(session_id).await
    }

    /// List pending and running tasks.
    pub async fn list_active_tasks(&self) -> CoreResult<Vec<Task>> {
        self.store
            .list_by_status(&[TaskStatus::Pending, TaskStatus::Running])
            .await
    }

    /// Aggregate task counts.
    pub async fn get_task_stats(&self) -> CoreResult<TaskStats> {
        self.store.stats().await
    }

    /// Crash-recovery resumption: adopt orphaned subprocess output, then
    /// claim and re-spawn resumable tasks. Returns how many workers were
    /// spawned.
    pub async fn resume_pending_tasks(&self) -> CoreResult<usize> {
        // Phase 1: let the injected policy dispose of orphans.
        if let (Some(resumer), Some(work_dir)) =
            (&self.orphan_resumer, &self.config.orphan_work_dir)
        {
            match resumer.resume_orphans(work_dir).await {
                Ok(results) => {
                    let counts = orphan::count_actions(&results);
                    info!(
                        adopted = counts.get(&OrphanAction::Adopted).copied().unwrap_or(0),
                        harvested = counts.get(&OrphanAction::Harvested).copied().unwrap_or(0),
                        marked_failed = counts.get(&OrphanAction::MarkedFailed).copied().unwrap_or(0),
                        retried = counts
                            .get(&OrphanAction::RetriedWithContext)
                            .copied()
                            .unwrap_or(0),
                        "Orphan bridge resumption complete"
                    );
                }
                Err(e) => warn!(error = %e, "Orphan bridge resumption failed"),
            }
        }

        // Phase 2: claim tasks whose leases are free or expired.
        let until = Utc::now() + self.lease_ttl();
        let claimed = self
            .store
            .claim_resumable_tasks(
                &self.config.owner_id,
                until,
                self.config.resume_batch_size,
                &[TaskStatus::Pending, TaskStatus::Running],
            )
            .await?;

        let mut spawned = 0;
        let mut skipped = 0;
        for task in claimed {
            let task_id = task.task_id.clone();

            let already_running = self
                .cancels
                .lock()
                .expect("cancel registry lock poisoned")
                .contains_key(&task_id);
            if already_running {
                skipped += 1;
                self.release_lease(&task_id).await;
                continue;
            }
            if task.description.trim().is_empty() || task.session_id.is_empty() {
                warn!(task_id = %task_id, "Skipping resumable task with invalid description or session");
                skipped += 1;
                self.release_lease(&task_id).await;
                continue;
            }

            // Resumed workers share the admission gate; without a free
            // slot the task waits for the next sweep.
            let permit = match Arc::clone(&self.admission).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(task_id = %task_id, "No admission slot for resumed task");
                    skipped += 1;
                    self.release_lease(&task_id).await;
                    continue;
                }
            };

            let handle = CancelHandle::new();
            self.cancels
                .lock()
                .expect("cancel registry lock poisoned")
                .insert(task_id.clone(), handle.clone());
            self.spawn_worker(task, handle, permit);
            spawned += 1;
        }

        info!(spawned, skipped, "Pending task resumption complete");
        Ok(spawned)
    }

    // -- Worker -------------------------------------------------------------

    fn cancellation_event(
        &self,
        session_id: &str,
        task_id: &str,
        reason: TerminationReason,
        cause: &str,
    ) -> AgentEvent {
        let mut payload = Map::new();
        payload.insert("reason".to_string(), Value::String(reason.to_string()));
        payload.insert("cause".to_string(), Value::String(cause.to_string()));
        AgentEvent::envelope(
            EventMeta::new(
                EVENT_WORKFLOW_RESULT_CANCELLED,
                session_id,
                task_id,
                self.next_seq(),
            ),
            payload,
        )
    }

    async fn release_lease(&self, task_id: &str) {
        if let Err(e) = self
            .store
            .release_task_lease(task_id, &self.config.owner_id)
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to release task lease");
        }
    }

    fn spawn_worker(&self, task: Task, handle: CancelHandle, permit: OwnedSemaphorePermit) {
        let service = self.clone();
        let span = info_span!(
            "task_execution",
            task_id = %task.task_id,
            session_id = %task.session_id
        );
        tokio::spawn(
            async move {
                service.run_worker(task, handle, permit).await;
            }
            .instrument(span),
        );
    }

    /// One task's background worker: executes, classifies the outcome,
    /// and tears everything down. Every exit path stops the lease
    /// renewer, releases admission and the lease, and clears the cancel
    /// registry entry.
    async fn run_worker(&self, task: Task, handle: CancelHandle, permit: OwnedSemaphorePermit) {
        let task_id = task.task_id.clone();
        let session_id = task.session_id.clone();
        let started = tokio::time::Instant::now();
        self.metrics.active_tasks.fetch_add(1, Ordering::Relaxed);

        // Renew the lease until told to stop; losing it cancels the
        // local execution so the new owner runs alone.
        let renew_stop = CancellationToken::new();
        let renewer = {
            let service = self.clone();
            let task_id = task_id.clone();
            let handle = handle.clone();
            let stop = renew_stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(service.config.lease_renew_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            let until = Utc::now() + service.lease_ttl();
                            match service
                                .store
                                .renew_task_lease(&task_id, &service.config.owner_id, until)
                                .await
                            {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!(task_id = %task_id, "Task lease lost to another process");
                                    handle.cancel(CancelCause::LeaseLost);
                                    break;
                                }
                                Err(e) => {
                                    warn!(task_id = %task_id, error = %e, "Lease renewal errored");
                                }
                            }
                        }
                    }
                }
            })
        };

        let outcome = self.execute_once(&task, &handle).await;
        self.finish_worker(&task_id, &session_id, outcome, &handle).await;

        renew_stop.cancel();
        let _ = renewer.await;
        drop(permit);
        self.release_lease(&task_id).await;
        self.cancels
            .lock()
            .expect("cancel registry lock poisoned")
            .remove(&task_id);
        self.progress.untrack(&session_id, &task_id);

        let elapsed = started.elapsed().as_millis() as u64;
        self.metrics
            .total_execution_ms
            .fetch_add(elapsed, Ordering::Relaxed);
        self.metrics.active_tasks.fetch_sub(1, Ordering::Relaxed);
        debug!(task_id = %task_id, elapsed_ms = elapsed, "Worker finished");
    }

    /// Transition to running and invoke the executor, containing panics.
    async fn execute_once(&self, task: &Task, handle: &CancelHandle) -> WorkerOutcome {
        if let Err(e) = self.store.set_status(&task.task_id, TaskStatus::Running).await {
            // Cancelled between admission and start-up.
            return WorkerOutcome::AlreadyTerminal(e);
        }
        self.progress.track(&task.session_id, &task.task_id);

        let context = ExecutionContext {
            task_id: task.task_id.clone(),
            session_id: task.session_id.clone(),
            description: task.description.clone(),
            agent_preset: task.agent_preset.clone(),
            tool_preset: task.tool_preset.clone(),
            cancel: handle.token.clone(),
        };
        let listener = self.listener();

        let execution = AssertUnwindSafe(self.executor.execute_task(context, listener)).catch_unwind();
        tokio::select! {
            _ = handle.token.cancelled() => WorkerOutcome::Cancelled,
            result = execution => match result {
                Ok(Ok(task_result)) => WorkerOutcome::Completed(task_result),
                Ok(Err(err)) if err.is_cancellation() => {
                    if matches!(err, CoreError::DeadlineExceeded(_)) {
                        handle.cancel(CancelCause::DeadlineExceeded);
                    }
                    WorkerOutcome::Cancelled
                }
                Ok(Err(err)) => WorkerOutcome::Failed(err),
                Err(panic) => WorkerOutcome::Panicked(panic_message(panic)),
            },
        }
    }

    async fn finish_worker(
        &self,
        task_id: &str,
        session_id: &str,
        outcome: WorkerOutcome,
        handle: &CancelHandle,
    ) {
        match outcome {
            WorkerOutcome::Completed(result) => {
                if let Err(e) = self.store.set_result(task_id, result).await {
                    warn!(task_id = %task_id, error = %e, "Failed to record task result");
                }
                self.metrics.completed_tasks.fetch_add(1, Ordering::Relaxed);
                self.record_analytics("task_completed", task_id, session_id, Map::new())
                    .await;
            }
            WorkerOutcome::Failed(err) => {
                if let Err(e) = self.store.set_error(task_id, &err.to_string()).await {
                    warn!(task_id = %task_id, error = %e, "Failed to record task error");
                }
                self.metrics.failed_tasks.fetch_add(1, Ordering::Relaxed);
                let mut props = Map::new();
                props.insert("error".to_string(), Value::String(err.to_string()));
                self.record_analytics("task_failed", task_id, session_id, props).await;
            }
            WorkerOutcome::Panicked(message) => {
                let error = format!("panic: {}", message);
                if let Err(e) = self.store.set_error(task_id, &error).await {
                    warn!(task_id = %task_id, error = %e, "Failed to record task panic");
                }
                self.metrics.failed_tasks.fetch_add(1, Ordering::Relaxed);
                let mut props = Map::new();
                props.insert("error".to_string(), Value::String(error));
                self.record_analytics("task_failed", task_id, session_id, props).await;
            }
            WorkerOutcome::Cancelled => {
                let cause = handle.cause().unwrap_or(CancelCause::UserRequested);
                let reason = cause.termination_reason();
                if let Err(e) = self
                    .store
                    .set_status_with_reason(task_id, TaskStatus::Cancelled, reason)
                    .await
                {
                    debug!(task_id = %task_id, error = %e, "Cancellation already recorded");
                }
                self.emit(&self.cancellation_event(session_id, task_id, reason, cause.describe()))
                    .await;
                self.metrics.cancelled_tasks.fetch_add(1, Ordering::Relaxed);
                let mut props = Map::new();
                props.insert("reason".to_string(), Value::String(reason.to_string()));
                self.record_analytics("task_cancelled", task_id, session_id, props).await;
            }
            WorkerOutcome::AlreadyTerminal(err) => {
                debug!(task_id = %task_id, error = %err, "Worker exited without executing");
            }
        }
    }
}

enum WorkerOutcome {
    Completed(TaskResult),
    Failed(CoreError),
    Cancelled,
    Panicked(String),
    AlreadyTerminal(CoreError),
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
