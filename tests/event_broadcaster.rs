//! Tests for the event broadcaster: registration, fan-out, drop
//! notifications, history rings and metrics.

mod common;

use common::make_event;
use tokio::sync::mpsc;

use agentd_core::events::{EventBroadcaster, HistoryFilter};
use agentd_core::types::AgentEvent;
use agentd_core::utils::constants::{EVENT_STREAM_DROPPED, GLOBAL_SESSION_ID};

#[tokio::test]
async fn delivers_to_all_subscribers_of_a_session() {
    let broadcaster = EventBroadcaster::new();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    broadcaster.register_client("s1", tx_a);
    broadcaster.register_client("s1", tx_b);

    broadcaster.broadcast(&make_event("s1", "workflow.node.started", 1));

    assert_eq!(rx_a.try_recv().unwrap().meta().seq, 1);
    assert_eq!(rx_b.try_recv().unwrap().meta().seq, 1);
}

#[tokio::test]
async fn other_sessions_receive_nothing() {
    let broadcaster = EventBroadcaster::new();
    let (tx, mut rx) = mpsc::channel(8);
    broadcaster.register_client("s2", tx);

    broadcaster.broadcast(&make_event("s1", "workflow.node.started", 1));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unregister_stops_delivery() {
    let broadcaster = EventBroadcaster::new();
    let (tx, mut rx) = mpsc::channel(8);
    broadcaster.register_client("s1", tx.clone());
    broadcaster.unregister_client("s1", &tx);

    broadcaster.broadcast(&make_event("s1", "workflow.node.started", 1));
    assert!(rx.try_recv().is_err());
    assert_eq!(broadcaster.metrics().active_clients, 0);
}

#[tokio::test]
async fn full_sink_drops_and_notifies() {
    let broadcaster = EventBroadcaster::new();
    // Capacity 1: the first event fills the sink, the second drops.
    let (tx, mut rx) = mpsc::channel(1);
    broadcaster.register_client("s1", tx);

    broadcaster.broadcast(&make_event("s1", "workflow.node.started", 1));
    broadcaster.broadcast(&make_event("s1", "workflow.node.completed", 2));

    let metrics = broadcaster.metrics();
    assert_eq!(metrics.dropped_events, 1);
    assert_eq!(metrics.drops_per_session["s1"], 1);

    // The delivered event is the first one; the notification could not
    // fit and was abandoned.
    let delivered = rx.try_recv().unwrap();
    assert_eq!(delivered.event_type(), "workflow.node.started");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn drop_notifications_arrive_while_a_consumer_drains() {
    let broadcaster = std::sync::Arc::new(EventBroadcaster::new());
    let (tx, mut rx) = mpsc::channel(1);
    broadcaster.register_client("s1", tx);

    // A consumer that drains continuously while the producer bursts;
    // some drops' notifications find room in the freed slot.
    let consumer = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await
        {
            received.push(event);
        }
        received
    });

    for seq in 0..200u64 {
        broadcaster.broadcast(&make_event("s1", "workflow.node.completed", seq));
        if seq % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let received = consumer.await.unwrap();
    let notifications: Vec<&AgentEvent> = received
        .iter()
        .filter(|e| e.event_type() == EVENT_STREAM_DROPPED)
        .collect();
    assert!(broadcaster.metrics().dropped_events > 0);

    // Every notification that did land carries the drop metadata.
    for notification in notifications {
        match notification {
            AgentEvent::Envelope(env) => {
                assert_eq!(
                    env.payload["dropped_event_type"].as_str().unwrap(),
                    "workflow.node.completed"
                );
                assert!(env.payload["total_drops"].as_u64().unwrap() >= 1);
            }
            _ => panic!("expected an envelope"),
        }
    }
}

#[tokio::test]
async fn global_session_fans_out_everywhere() {
    let broadcaster = EventBroadcaster::new();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    broadcaster.register_client("s-a", tx_a);
    broadcaster.register_client("s-b", tx_b);

    broadcaster.broadcast(&make_event(GLOBAL_SESSION_ID, "workflow.node.started", 7));

    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_ok());
}

#[tokio::test]
async fn registration_leaves_existing_snapshots_untouched() {
    let broadcaster = EventBroadcaster::new();
    let (tx, _rx) = mpsc::channel(4);
    broadcaster.register_client("s1", tx);

    let snapshot = broadcaster.client_snapshot();
    let sessions_before = snapshot.len();
    let sinks_before = snapshot.get("s1").unwrap().len();

    let (tx2, _rx2) = mpsc::channel(4);
    broadcaster.register_client("s1", tx2);
    let (tx3, _rx3) = mpsc::channel(4);
    broadcaster.register_client("s2", tx3);

    // The old snapshot is unchanged in length and contents.
    assert_eq!(snapshot.len(), sessions_before);
    assert_eq!(snapshot.get("s1").unwrap().len(), sinks_before);
    assert!(snapshot.get("s2").is_none());

    let fresh = broadcaster.client_snapshot();
    assert_eq!(fresh.len(), 2);
    assert_eq!(fresh.get("s1").unwrap().len(), 2);
}

#[tokio::test]
async fn history_preserves_append_order() {
    let broadcaster = EventBroadcaster::new();
    for seq in 0..5 {
        broadcaster.broadcast(&make_event("s1", "workflow.node.started", seq));
    }

    let history = broadcaster.get_event_history("s1");
    let seqs: Vec<u64> = history.iter().map(|e| e.meta().seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn stream_history_filters_by_type_prefix_and_stops_early() {
    let broadcaster = EventBroadcaster::new();
    broadcaster.broadcast(&make_event("s1", "workflow.node.started", 0));
    broadcaster.broadcast(&make_event("s1", "workflow.diagnostic.context_snapshot", 1));
    broadcaster.broadcast(&make_event("s1", "workflow.diagnostic.context_snapshot", 2));
    broadcaster.broadcast(&make_event("s1", "workflow.node.completed", 3));

    let filter = HistoryFilter {
        session_id: Some("s1".to_string()),
        event_type_prefix: Some("workflow.diagnostic.".to_string()),
    };

    let mut seen = Vec::new();
    broadcaster.stream_history(&filter, |event| {
        seen.push(event.meta().seq);
        true
    });
    assert_eq!(seen, vec![1, 2]);

    // Early stop after the first match.
    let mut first = None;
    broadcaster.stream_history(&filter, |event| {
        first = Some(event.meta().seq);
        false
    });
    assert_eq!(first, Some(1));
}

#[tokio::test]
async fn metrics_reflect_history_and_clients() {
    let broadcaster = EventBroadcaster::new();
    let (tx, _rx) = mpsc::channel(8);
    broadcaster.register_client("s1", tx);
    broadcaster.broadcast(&make_event("s1", "workflow.node.started", 0));
    broadcaster.broadcast(&make_event("s2", "workflow.node.started", 0));

    let metrics = broadcaster.metrics();
    assert_eq!(metrics.active_clients, 1);
    assert_eq!(metrics.history_sessions, 2);
    assert_eq!(metrics.history_events, 2);
    assert_eq!(metrics.dropped_events, 0);
}
