//! Event broadcaster — non-blocking fan-out to per-session subscribers.
//!
//! Producers never block: each subscriber is a bounded sink and a full
//! sink drops the event, surfaced to the subscriber through a synthetic
//! `stream.dropped` envelope. The client registry is copy-on-write so the
//! broadcast path reads a stable snapshot without locking.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::types::{AgentEvent, EventMeta};
use crate::utils::constants::{EVENT_STREAM_DROPPED, GLOBAL_SESSION_ID};

use super::EventListener;

/// Default per-session history ring capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// A subscriber's bounded FIFO sink. The subscriber chooses the capacity
/// when creating the channel.
pub type EventSink = mpsc::Sender<AgentEvent>;

type ClientMap = HashMap<String, Arc<Vec<EventSink>>>;

/// Filter for [`EventBroadcaster::stream_history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Restrict to one session's ring.
    pub session_id: Option<String>,

    /// Restrict to event types with this prefix.
    pub event_type_prefix: Option<String>,
}

impl HistoryFilter {
    fn matches(&self, event: &AgentEvent) -> bool {
        if let Some(ref prefix) = self.event_type_prefix {
            if !event.event_type().starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Counters exposed by [`EventBroadcaster::metrics`].
#[derive(Debug, Clone, Default)]
pub struct BroadcasterMetrics {
    /// Total events dropped across all subscribers.
    pub dropped_events: u64,

    /// Dropped events per session.
    pub drops_per_session: HashMap<String, u64>,

    /// Total events currently retained in history rings.
    pub history_events: usize,

    /// Number of sessions with a history ring.
    pub history_sessions: usize,

    /// Registered subscriber sinks across all sessions.
    pub active_clients: usize,
}

/// Routes events from the agent executor to per-session subscribers.
///
/// Registration updates are copy-on-write: every register/unregister
/// builds a fresh root map and swaps it atomically, so snapshots taken by
/// concurrent broadcasts remain valid and unchanged. History rings are
/// bounded per session, oldest evicted first.
pub struct EventBroadcaster {
    clients: ArcSwap<ClientMap>,
    /// Serializes registry writers; readers never take it.
    registry_write: Mutex<()>,
    histories: RwLock<HashMap<String, Arc<Mutex<VecDeque<AgentEvent>>>>>,
    history_capacity: usize,
    dropped_events: AtomicU64,
    drops_per_session: Mutex<HashMap<String, u64>>,
    synthetic_seq: AtomicU64,
}

impl EventBroadcaster {
    /// Create a broadcaster with the default history ring capacity.
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a broadcaster with the given per-session history capacity.
    pub fn with_history_capacity(history_capacity: usize) -> Self {
        assert!(history_capacity > 0, "history capacity must be greater than 0");
        Self {
            clients: ArcSwap::from_pointee(ClientMap::new()),
            registry_write: Mutex::new(()),
            histories: RwLock::new(HashMap::new()),
            history_capacity,
            dropped_events: AtomicU64::new(0),
            drops_per_session: Mutex::new(HashMap::new()),
            synthetic_seq: AtomicU64::new(0),
        }
    }

    /// Register a subscriber sink for a session.
    ///
    /// The root client map is replaced atomically; snapshots held by
    /// in-flight broadcasts are unaffected.
    pub fn register_client(&self, session_id: &str, sink: EventSink) {
        let _guard = self.registry_write.lock().expect("registry lock poisoned");
        let current = self.clients.load_full();
        let mut next: ClientMap = (*current).clone();

        let sinks = next.entry(session_id.to_string()).or_default();
        let mut updated = (**sinks).clone();
        updated.push(sink);
        *sinks = Arc::new(updated);

        self.clients.store(Arc::new(next));
        debug!(session_id = %session_id, "Client registered");
    }

    /// Remove a subscriber sink from a session.
    ///
    /// Sinks are matched by channel identity; unknown sinks are ignored.
    pub fn unregister_client(&self, session_id: &str, sink: &EventSink) {
        let _guard = self.registry_write.lock().expect("registry lock poisoned");
        let current = self.clients.load_full();
        let Some(sinks) = current.get(session_id) else {
            return;
        };

        let remaining: Vec<EventSink> = sinks
            .iter()
            .filter(|s| !s.same_channel(sink))
            .cloned()
            .collect();

        let mut next: ClientMap = (*current).clone();
        if remaining.is_empty() {
            next.remove(session_id);
        } else {
            next.insert(session_id.to_string(), Arc::new(remaining));
        }
        self.clients.store(Arc::new(next));
        debug!(session_id = %session_id, "Client unregistered");
    }

    /// Current snapshot of the client registry. The snapshot is immutable;
    /// later registrations do not alter it.
    pub fn client_snapshot(&self) -> Arc<ClientMap> {
        self.clients.load_full()
    }

    /// Broadcast one event to its target sessions.
    ///
    /// Events addressed to the reserved global session fan out to every
    /// registered session; events with an empty session id are dropped.
    pub fn broadcast(&self, event: &AgentEvent) {
        let session_id = event.session_id();
        if session_id.is_empty() {
            trace!(event_type = %event.event_type(), "Dropping event with empty session id");
            return;
        }

        let snapshot = self.clients.load();
        if session_id == GLOBAL_SESSION_ID {
            for (target, sinks) in snapshot.iter() {
                self.deliver(target, sinks, event);
            }
        } else if let Some(sinks) = snapshot.get(session_id) {
            self.deliver(session_id, sinks, event);
        }

        self.append_history(event);
    }

    fn deliver(&self, session_id: &str, sinks: &Arc<Vec<EventSink>>, event: &AgentEvent) {
        for sink in sinks.iter() {
            if sink.try_send(event.clone()).is_err() {
                let total = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                let session_total = {
                    let mut drops = self
                        .drops_per_session
                        .lock()
                        .expect("drop counters lock poisoned");
                    let counter = drops.entry(session_id.to_string()).or_insert(0);
                    *counter += 1;
                    *counter
                };
                warn!(
                    session_id = %session_id,
                    event_type = %event.event_type(),
                    total_drops = total,
                    "Subscriber sink full, event dropped"
                );

                // Best effort: tell the subscriber it missed something.
                // If this does not fit either, it is abandoned silently.
                let _ = sink.try_send(self.drop_notification(event, session_id, session_total));
            }
        }
    }

    fn drop_notification(
        &self,
        dropped: &AgentEvent,
        session_id: &str,
        total_drops: u64,
    ) -> AgentEvent {
        let mut payload = Map::new();
        payload.insert(
            "dropped_event_type".to_string(),
            Value::String(dropped.event_type().to_string()),
        );
        payload.insert("total_drops".to_string(), Value::from(total_drops));

        let mut meta = EventMeta::new(
            EVENT_STREAM_DROPPED,
            session_id,
            dropped.run_id(),
            self.synthetic_seq.fetch_add(1, Ordering::Relaxed),
        );
        meta.agent_level = dropped.meta().agent_level;
        AgentEvent::envelope(meta, payload)
    }

    fn append_history(&self, event: &AgentEvent) {
        let ring = {
            let histories = self.histories.read().expect("history lock poisoned");
            histories.get(event.session_id()).cloned()
        };
        let ring = match ring {
            Some(ring) => ring,
            None => {
                let mut histories = self.histories.write().expect("history lock poisoned");
                histories
                    .entry(event.session_id().to_string())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(VecDeque::with_capacity(self.history_capacity)))
                    })
                    .clone()
            }
        };

        let mut ring = ring.lock().expect("history ring lock poisoned");
        if ring.len() == self.history_capacity {
            ring.pop_front();
        }
        ring.push_back(event.clone());
    }

    /// All retained history for a session, in append order.
    pub fn get_event_history(&self, session_id: &str) -> Vec<AgentEvent> {
        let ring = {
            let histories = self.histories.read().expect("history lock poisoned");
            histories.get(session_id).cloned()
        };
        match ring {
            Some(ring) => ring
                .lock()
                .expect("history ring lock poisoned")
                .iter()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Stream retained history through `f` in append order.
    ///
    /// `f` returns whether to continue; returning `false` stops the
    /// scan. Without a session filter, sessions are visited in sorted
    /// order for determinism.
    pub fn stream_history<F>(&self, filter: &HistoryFilter, mut f: F)
    where
        F: FnMut(&AgentEvent) -> bool,
    {
        let sessions: Vec<String> = match filter.session_id {
            Some(ref sid) => vec![sid.clone()],
            None => {
                let histories = self.histories.read().expect("history lock poisoned");
                let mut keys: Vec<String> = histories.keys().cloned().collect();
                keys.sort();
                keys
            }
        };

        for session in sessions {
            for event in self.get_event_history(&session) {
                if !filter.matches(&event) {
                    continue;
                }
                if !f(&event) {
                    return;
                }
            }
        }
    }

    /// Current broadcaster counters.
    pub fn metrics(&self) -> BroadcasterMetrics {
        let histories = self.histories.read().expect("history lock poisoned");
        let history_events = histories
            .values()
            .map(|ring| ring.lock().expect("history ring lock poisoned").len())
            .sum();
        let history_sessions = histories.len();
        drop(histories);

        let clients = self.clients.load();
        let active_clients = clients.values().map(|sinks| sinks.len()).sum();

        BroadcasterMetrics {
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            drops_per_session: self
                .drops_per_session
                .lock()
                .expect("drop counters lock poisoned")
                .clone(),
            history_events,
            history_sessions,
            active_clients,
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventListener for EventBroadcaster {
    async fn on_event(&self, event: &AgentEvent) {
        self.broadcast(event);
    }
}
