//! Shared test utilities for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use agentd_core::error::{CoreError, CoreResult};
use agentd_core::events::EventListener;
use agentd_core::history::{EventHistoryStore, EventRecord};
use agentd_core::service::{AgentExecutor, ExecutionContext};
use agentd_core::types::{AgentEvent, EventMeta, TaskResult};

/// An agent that emits a couple of workflow events and completes
/// immediately, echoing the description back.
pub struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute_task(
        &self,
        context: ExecutionContext,
        listener: std::sync::Arc<dyn EventListener>,
    ) -> CoreResult<TaskResult> {
        let mut payload = serde_json::Map::new();
        payload.insert("iteration".to_string(), serde_json::json!(1));
        payload.insert("tokens_used".to_string(), serde_json::json!(42));
        listener
            .on_event(&AgentEvent::envelope(
                EventMeta::new(
                    "workflow.node.completed",
                    &context.session_id,
                    &context.task_id,
                    1,
                ),
                payload,
            ))
            .await;

        Ok(TaskResult {
            answer: format!("Echo: {}", context.description),
            iterations: 1,
            total_tokens: 42,
            stop_reason: Some("finished".to_string()),
            session_id: context.session_id.clone(),
        })
    }
}

/// An agent that sleeps until cancelled (or for `delay`, whichever comes
/// first).
pub struct SlowExecutor {
    pub delay: Duration,
}

#[async_trait]
impl AgentExecutor for SlowExecutor {
    async fn execute_task(
        &self,
        context: ExecutionContext,
        _listener: std::sync::Arc<dyn EventListener>,
    ) -> CoreResult<TaskResult> {
        tokio::select! {
            _ = context.cancel.cancelled() => Err(CoreError::cancelled("execution cancelled")),
            _ = tokio::time::sleep(self.delay) => Ok(TaskResult {
                answer: "slept".to_string(),
                iterations: 1,
                total_tokens: 0,
                stop_reason: Some("finished".to_string()),
                session_id: context.session_id.clone(),
            }),
        }
    }
}

/// An agent that always fails.
pub struct FailingExecutor;

#[async_trait]
impl AgentExecutor for FailingExecutor {
    async fn execute_task(
        &self,
        _context: ExecutionContext,
        _listener: std::sync::Arc<dyn EventListener>,
    ) -> CoreResult<TaskResult> {
        Err(CoreError::internal("model exploded"))
    }
}

/// An agent that reports hitting its deadline.
pub struct DeadlineExecutor;

#[async_trait]
impl AgentExecutor for DeadlineExecutor {
    async fn execute_task(
        &self,
        _context: ExecutionContext,
        _listener: std::sync::Arc<dyn EventListener>,
    ) -> CoreResult<TaskResult> {
        Err(CoreError::deadline_exceeded("execution deadline elapsed"))
    }
}

/// An agent that panics mid-execution.
pub struct PanickingExecutor;

#[async_trait]
impl AgentExecutor for PanickingExecutor {
    async fn execute_task(
        &self,
        _context: ExecutionContext,
        _listener: std::sync::Arc<dyn EventListener>,
    ) -> CoreResult<TaskResult> {
        panic!("executor blew up");
    }
}

/// In-memory inner history store that records every append and can be
/// told to fail.
#[derive(Default)]
pub struct RecordingHistoryStore {
    records: Mutex<Vec<EventRecord>>,
    pub append_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub fail_appends: AtomicBool,
    /// Fail individual appends once this many records exist.
    pub fail_after: AtomicUsize,
}

impl RecordingHistoryStore {
    pub fn new() -> Self {
        Self {
            fail_after: AtomicUsize::new(usize::MAX),
            ..Default::default()
        }
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl EventHistoryStore for RecordingHistoryStore {
    async fn append(&self, event: &AgentEvent) -> CoreResult<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(CoreError::internal("injected append failure"));
        }
        let mut records = self.records.lock().unwrap();
        if records.len() >= self.fail_after.load(Ordering::SeqCst) {
            return Err(CoreError::internal("injected append failure"));
        }
        records.push(EventRecord::from_event(event));
        Ok(())
    }

    async fn stream(&self, session_id: &str) -> CoreResult<Vec<EventRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> CoreResult<()> {
        self.records
            .lock()
            .unwrap()
            .retain(|r| r.session_id != session_id);
        Ok(())
    }

    async fn has_session_events(&self, session_id: &str) -> CoreResult<bool> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.session_id == session_id))
    }
}

/// Inner store that counts batch appends (native batch capability).
pub struct BatchCountingStore {
    inner: RecordingHistoryStore,
}

impl BatchCountingStore {
    pub fn new() -> Self {
        Self {
            inner: RecordingHistoryStore::new(),
        }
    }

    pub fn batch_calls(&self) -> usize {
        self.inner.batch_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl EventHistoryStore for BatchCountingStore {
    async fn append(&self, event: &AgentEvent) -> CoreResult<()> {
        self.inner.append(event).await
    }

    async fn append_batch(
        &self,
        events: &[AgentEvent],
    ) -> Result<(), agentd_core::history::BatchAppendError> {
        self.inner.batch_calls.fetch_add(1, Ordering::SeqCst);
        for (sent, event) in events.iter().enumerate() {
            if let Err(source) = self.inner.append(event).await {
                return Err(agentd_core::history::BatchAppendError { sent, source });
            }
        }
        Ok(())
    }

    async fn stream(&self, session_id: &str) -> CoreResult<Vec<EventRecord>> {
        self.inner.stream(session_id).await
    }

    async fn delete_session(&self, session_id: &str) -> CoreResult<()> {
        self.inner.delete_session(session_id).await
    }

    async fn has_session_events(&self, session_id: &str) -> CoreResult<bool> {
        self.inner.has_session_events(session_id).await
    }
}

/// Build a plain envelope event for a session.
pub fn make_event(session: &str, event_type: &str, seq: u64) -> AgentEvent {
    AgentEvent::envelope(
        EventMeta::new(event_type, session, "run-1", seq),
        serde_json::Map::new(),
    )
}

/// Poll until `check` passes or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
