//! Tests for the snapshot / replay service.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use agentd_core::error::{CoreError, CoreResult};
use agentd_core::events::EventBroadcaster;
use agentd_core::replay::{
    JournalEntry, JournalReader, ReplayService, SessionSnapshot, SnapshotStateStore,
};
use agentd_core::types::{AgentEvent, EventMeta};
use agentd_core::utils::constants::EVENT_DIAGNOSTIC_CONTEXT_SNAPSHOT;

struct FixedJournal {
    entries: Vec<JournalEntry>,
}

#[async_trait]
impl JournalReader for FixedJournal {
    async fn read_session(&self, session_id: &str) -> CoreResult<Vec<JournalEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct RecordingStateStore {
    snapshots: Mutex<Vec<SessionSnapshot>>,
    clears: Mutex<Vec<String>>,
    inits: Mutex<Vec<String>>,
}

#[async_trait]
impl SnapshotStateStore for RecordingStateStore {
    async fn clear_session(&self, session_id: &str) -> CoreResult<()> {
        self.clears.lock().unwrap().push(session_id.to_string());
        self.snapshots
            .lock()
            .unwrap()
            .retain(|s| s.session_id != session_id);
        Ok(())
    }

    async fn init_session(&self, session_id: &str) -> CoreResult<()> {
        self.inits.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn put_snapshot(&self, snapshot: SessionSnapshot) -> CoreResult<()> {
        self.snapshots.lock().unwrap().push(snapshot);
        Ok(())
    }
}

fn entry(session: &str, turn: u64, state: serde_json::Value) -> JournalEntry {
    JournalEntry {
        session_id: session.to_string(),
        turn,
        state,
    }
}

#[tokio::test]
async fn replay_materializes_one_snapshot_per_turn() {
    let journal = Arc::new(FixedJournal {
        entries: vec![
            entry("s1", 1, json!({"messages": 1})),
            entry("s1", 2, json!({"messages": 2, "draft": true})),
            // A later entry for turn 2 supersedes the first.
            entry("s1", 2, json!({"messages": 2})),
            entry("s-other", 1, json!({})),
        ],
    });
    let state = Arc::new(RecordingStateStore::default());
    let service = ReplayService::new(journal).with_state_store(state.clone());

    let count = service.replay_session("s1").await.unwrap();
    assert_eq!(count, 2);

    let snapshots = state.snapshots.lock().unwrap().clone();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].turn, 1);
    assert_eq!(snapshots[1].turn, 2);
    assert_eq!(snapshots[1].state, json!({"messages": 2}));

    assert_eq!(state.clears.lock().unwrap().as_slice(), ["s1"]);
    assert_eq!(state.inits.lock().unwrap().as_slice(), ["s1"]);
}

#[tokio::test]
async fn replay_is_idempotent() {
    let journal = Arc::new(FixedJournal {
        entries: vec![entry("s1", 1, json!({"messages": 1}))],
    });
    let state = Arc::new(RecordingStateStore::default());
    let service = ReplayService::new(journal).with_state_store(state.clone());

    service.replay_session("s1").await.unwrap();
    service.replay_session("s1").await.unwrap();

    // The second replay cleared and rewrote; no duplicates remain.
    assert_eq!(state.snapshots.lock().unwrap().len(), 1);
    assert_eq!(state.clears.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn replay_of_unknown_session_is_not_found() {
    let journal = Arc::new(FixedJournal { entries: vec![] });
    let state = Arc::new(RecordingStateStore::default());
    let service = ReplayService::new(journal).with_state_store(state);

    assert!(matches!(
        service.replay_session("ghost").await.unwrap_err(),
        CoreError::NotFound(_)
    ));
}

#[tokio::test]
async fn replay_without_state_store_is_unavailable() {
    let journal = Arc::new(FixedJournal { entries: vec![] });
    let service = ReplayService::new(journal);
    assert!(matches!(
        service.replay_session("s1").await.unwrap_err(),
        CoreError::Unavailable(_)
    ));
}

#[tokio::test]
async fn replay_rejects_empty_session_id() {
    let journal = Arc::new(FixedJournal { entries: vec![] });
    let state = Arc::new(RecordingStateStore::default());
    let service = ReplayService::new(journal).with_state_store(state);
    assert!(matches!(
        service.replay_session("").await.unwrap_err(),
        CoreError::Validation(_)
    ));
}

fn snapshot_event(session: &str, seq: u64, data: serde_json::Value) -> AgentEvent {
    AgentEvent::kinded(
        EventMeta::new(EVENT_DIAGNOSTIC_CONTEXT_SNAPSHOT, session, "run-1", seq),
        "context_snapshot",
        data,
    )
}

#[tokio::test]
async fn context_snapshots_come_from_broadcaster_history() {
    let broadcaster = Arc::new(EventBroadcaster::new());
    broadcaster.broadcast(&common::make_event("s1", "workflow.node.started", 0));
    broadcaster.broadcast(&snapshot_event("s1", 1, json!({"window": {"used": 100}})));
    broadcaster.broadcast(&snapshot_event("s1", 2, json!({"window": {"used": 250}})));
    broadcaster.broadcast(&snapshot_event("s-other", 3, json!({})));

    let journal = Arc::new(FixedJournal { entries: vec![] });
    let service = ReplayService::new(journal).with_broadcaster(broadcaster);

    let snapshots = service.get_context_snapshots("s1").unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].seq, 1);
    assert_eq!(snapshots[1].seq, 2);
    assert_eq!(snapshots[1].data["window"]["used"], 250);
}

#[tokio::test]
async fn context_window_preview_uses_the_newest_snapshot() {
    let broadcaster = Arc::new(EventBroadcaster::new());
    broadcaster.broadcast(&snapshot_event("s1", 1, json!({"window": {"used": 100}})));
    broadcaster.broadcast(&snapshot_event("s1", 2, json!({"window": {"used": 900}})));

    let journal = Arc::new(FixedJournal { entries: vec![] });
    let service = ReplayService::new(journal).with_broadcaster(broadcaster);

    let preview = service.context_window_preview("s1").unwrap();
    assert_eq!(preview, json!({"used": 900}));
}

#[tokio::test]
async fn context_window_preview_without_snapshots_is_not_found() {
    let broadcaster = Arc::new(EventBroadcaster::new());
    let journal = Arc::new(FixedJournal { entries: vec![] });
    let service = ReplayService::new(journal).with_broadcaster(broadcaster);

    assert!(matches!(
        service.context_window_preview("s1").unwrap_err(),
        CoreError::NotFound(_)
    ));
}

#[tokio::test]
async fn snapshot_views_without_broadcaster_are_unavailable() {
    let journal = Arc::new(FixedJournal { entries: vec![] });
    let service = ReplayService::new(journal);
    assert!(matches!(
        service.get_context_snapshots("s1").unwrap_err(),
        CoreError::Unavailable(_)
    ));
}
