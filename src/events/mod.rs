//! Event streaming — listener seam and the session broadcaster.
//!
//! The agent executor emits [`AgentEvent`]s through the [`EventListener`]
//! capability. The [`EventBroadcaster`] is the primary listener, fanning
//! events out to per-session subscribers; [`MultiEventListener`] composes
//! it with the progress tracker and the history sink.

mod broadcaster;

pub use broadcaster::{
    BroadcasterMetrics, EventBroadcaster, EventSink, HistoryFilter, DEFAULT_HISTORY_CAPACITY,
};

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::AgentEvent;

/// Capability consumed by the agent executor to emit workflow events.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Observe one emitted event. Implementations must not block the
    /// producer; slow consumers drop rather than wait.
    async fn on_event(&self, event: &AgentEvent);
}

/// Fan-out wrapper delivering each event to several listeners in order.
///
/// Constructed from optional listeners; absent entries are skipped, so
/// call sites can wire up whatever subset of broadcaster / progress
/// tracker / history sink is configured.
pub struct MultiEventListener {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl MultiEventListener {
    /// Build from optional listeners, skipping the absent ones.
    pub fn new(listeners: Vec<Option<Arc<dyn EventListener>>>) -> Self {
        Self {
            listeners: listeners.into_iter().flatten().collect(),
        }
    }

    /// Number of wired listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listener is wired.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[async_trait]
impl EventListener for MultiEventListener {
    async fn on_event(&self, event: &AgentEvent) {
        for listener in &self.listeners {
            listener.on_event(event).await;
        }
    }
}
