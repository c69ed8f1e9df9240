//! Snapshot / replay service — rehydrates per-turn session snapshots
//! from a journal stream and exposes diagnostic context snapshots from
//! broadcaster history.
//!
//! The journal reader and the snapshot state store are injected; this
//! service only materializes and routes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::events::{EventBroadcaster, HistoryFilter};
use crate::types::AgentEvent;
use crate::utils::constants::EVENT_DIAGNOSTIC_CONTEXT_SNAPSHOT;

/// One entry read back from the journal.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// The owning session.
    pub session_id: String,

    /// The turn this entry belongs to.
    pub turn: u64,

    /// The state recorded for the turn.
    pub state: Value,
}

/// Injected source of journal entries for a session.
#[async_trait]
pub trait JournalReader: Send + Sync {
    /// Every journal entry for the session, in journal order.
    async fn read_session(&self, session_id: &str) -> CoreResult<Vec<JournalEntry>>;
}

/// A materialized per-turn snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// The owning session.
    pub session_id: String,

    /// The turn the snapshot captures.
    pub turn: u64,

    /// The turn's final state.
    pub state: Value,
}

/// Injected store holding materialized snapshots.
#[async_trait]
pub trait SnapshotStateStore: Send + Sync {
    /// Drop all snapshots for the session.
    async fn clear_session(&self, session_id: &str) -> CoreResult<()>;

    /// Prepare the session for a fresh set of snapshots.
    async fn init_session(&self, session_id: &str) -> CoreResult<()>;

    /// Persist one snapshot.
    async fn put_snapshot(&self, snapshot: SessionSnapshot) -> CoreResult<()>;
}

/// Record form of a diagnostic context snapshot pulled from broadcaster
/// history.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshotRecord {
    /// The owning session.
    pub session_id: String,

    /// The run the snapshot was taken in.
    pub run_id: String,

    /// Emitter-assigned sequence number.
    pub seq: u64,

    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,

    /// The snapshot contents.
    pub data: Value,
}

/// Rehydrates session snapshots and serves context-snapshot views.
pub struct ReplayService {
    journal: Arc<dyn JournalReader>,
    state: Option<Arc<dyn SnapshotStateStore>>,
    broadcaster: Option<Arc<EventBroadcaster>>,
}

impl ReplayService {
    /// Create a replay service over the given journal reader.
    pub fn new(journal: Arc<dyn JournalReader>) -> Self {
        Self {
            journal,
            state: None,
            broadcaster: None,
        }
    }

    /// Attach the snapshot state store. Required for `replay_session`.
    pub fn with_state_store(mut self, state: Arc<dyn SnapshotStateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Attach the broadcaster whose history backs the snapshot views.
    pub fn with_broadcaster(mut self, broadcaster: Arc<EventBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Rebuild a session's per-turn snapshots from the journal.
    ///
    /// Reads every entry, folds them into one snapshot per turn (the
    /// last entry for a turn wins), clears and re-initializes the state
    /// store, and writes the snapshots back in turn order. Idempotent;
    /// `NotFound` when the journal holds nothing for the session.
    pub async fn replay_session(&self, session_id: &str) -> CoreResult<usize> {
        if session_id.is_empty() {
            return Err(CoreError::validation("session id must not be empty"));
        }
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| CoreError::unavailable("snapshot state store not configured"))?;

        let entries = self.journal.read_session(session_id).await?;
        if entries.is_empty() {
            return Err(CoreError::not_found(format!(
                "no journal entries for session {}",
                session_id
            )));
        }

        let mut turns: BTreeMap<u64, Value> = BTreeMap::new();
        for entry in entries {
            turns.insert(entry.turn, entry.state);
        }

        state.clear_session(session_id).await?;
        state.init_session(session_id).await?;

        let count = turns.len();
        for (turn, value) in turns {
            state
                .put_snapshot(SessionSnapshot {
                    session_id: session_id.to_string(),
                    turn,
                    state: value,
                })
                .await?;
        }

        info!(session_id = %session_id, snapshots = count, "Session replayed");
        Ok(count)
    }

    /// Diagnostic context snapshots retained for a session, in emission
    /// order.
    pub fn get_context_snapshots(
        &self,
        session_id: &str,
    ) -> CoreResult<Vec<ContextSnapshotRecord>> {
        let broadcaster = self
            .broadcaster
            .as_ref()
            .ok_or_else(|| CoreError::unavailable("event broadcaster not configured"))?;

        let filter = HistoryFilter {
            session_id: Some(session_id.to_string()),
            event_type_prefix: Some(EVENT_DIAGNOSTIC_CONTEXT_SNAPSHOT.to_string()),
        };

        let mut records = Vec::new();
        broadcaster.stream_history(&filter, |event| {
            if let AgentEvent::Kinded(kinded) = event {
                records.push(ContextSnapshotRecord {
                    session_id: kinded.meta.session_id.clone(),
                    run_id: kinded.meta.run_id.clone(),
                    seq: kinded.meta.seq,
                    timestamp: kinded.meta.timestamp,
                    data: kinded.data.clone(),
                });
            }
            true
        });

        debug!(session_id = %session_id, count = records.len(), "Context snapshots collected");
        Ok(records)
    }

    /// Preview of the session's context window, assembled from the most
    /// recent diagnostic snapshot. `NotFound` when no snapshot is
    /// retained.
    pub fn context_window_preview(&self, session_id: &str) -> CoreResult<Value> {
        let snapshots = self.get_context_snapshots(session_id)?;
        let latest = snapshots.into_iter().last().ok_or_else(|| {
            CoreError::not_found(format!("no context snapshots for session {}", session_id))
        })?;

        // The window object is the preview; fall back to the full data.
        Ok(latest
            .data
            .get("window")
            .cloned()
            .unwrap_or(latest.data))
    }
}
