//! Progress projection — an event listener that folds workflow events
//! into the task store's progress counters.
//!
//! Keeping this out of the broadcaster keeps the fan-out path pure; the
//! store mutation happens on one explicit listener.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::events::EventListener;
use crate::store::TaskStore;
use crate::types::AgentEvent;

#[derive(Debug, Clone)]
struct ProgressEntry {
    task_id: String,
    iteration: u32,
    tokens_used: u64,
}

/// Projects `iteration` and `tokens_used` fields from workflow events
/// into [`TaskStore::update_progress`] for the task currently executing
/// in each session.
pub struct TaskProgressTracker {
    store: Arc<dyn TaskStore>,
    sessions: Mutex<HashMap<String, ProgressEntry>>,
}

impl TaskProgressTracker {
    /// Create a tracker writing through to the given store.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start projecting a session's events onto a task.
    pub fn track(&self, session_id: &str, task_id: &str) {
        let mut sessions = self.sessions.lock().expect("progress lock poisoned");
        sessions.insert(
            session_id.to_string(),
            ProgressEntry {
                task_id: task_id.to_string(),
                iteration: 0,
                tokens_used: 0,
            },
        );
    }

    /// Stop projecting a session, but only while it still maps to the
    /// given task (a newer task may have taken the session over).
    pub fn untrack(&self, session_id: &str, task_id: &str) {
        let mut sessions = self.sessions.lock().expect("progress lock poisoned");
        if sessions
            .get(session_id)
            .map(|entry| entry.task_id == task_id)
            .unwrap_or(false)
        {
            sessions.remove(session_id);
        }
    }

    fn fields(event: &AgentEvent) -> (Option<u32>, Option<u64>) {
        let get = |key: &str| -> Option<&Value> {
            match event {
                AgentEvent::Envelope(env) => env.payload.get(key),
                AgentEvent::Kinded(kinded) => kinded.data.get(key),
            }
        };
        let iteration = get("iteration").and_then(Value::as_u64).map(|v| v as u32);
        let tokens = get("tokens_used").and_then(Value::as_u64);
        (iteration, tokens)
    }
}

#[async_trait]
impl EventListener for TaskProgressTracker {
    async fn on_event(&self, event: &AgentEvent) {
        let (iteration, tokens) = Self::fields(event);
        if iteration.is_none() && tokens.is_none() {
            return;
        }

        let (task_id, iteration, tokens) = {
            let mut sessions = self.sessions.lock().expect("progress lock poisoned");
            let Some(entry) = sessions.get_mut(event.session_id()) else {
                return;
            };
            if let Some(iteration) = iteration {
                entry.iteration = iteration;
            }
            if let Some(tokens) = tokens {
                entry.tokens_used = tokens;
            }
            (entry.task_id.clone(), entry.iteration, entry.tokens_used)
        };

        if let Err(e) = self.store.update_progress(&task_id, iteration, tokens).await {
            debug!(task_id = %task_id, error = %e, "Progress update skipped");
        }
    }
}
