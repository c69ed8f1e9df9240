//! Durable event history — storage trait, record form, and stores.
//!
//! Replay endpoints read events back from an [`EventHistoryStore`]; the
//! hot streaming path writes through the [`AsyncEventHistoryStore`]
//! write-behind layer so it never blocks on I/O. [`EventRecord`] is the
//! sanitized storage form shared by every store (one JSON object per
//! JSONL line, one row per database record).

mod async_store;
mod file;
#[cfg(feature = "postgres")]
mod postgres;

pub use async_store::{
    AsyncEventHistoryStore, AsyncHistoryConfig, AsyncHistoryStats, DebugEventPolicy,
};
pub use file::FileEventHistoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventHistoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::types::{AgentEvent, AgentLevel, EventMeta, KindedEvent, WorkflowEnvelope};

/// RFC-3339 timestamps with nanosecond precision, the record wire format.
pub mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// EventRecord — the storage form
// ---------------------------------------------------------------------------

/// Discriminator for the two record shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// A kinded event (`kind` + `data`).
    Event,
    /// A workflow envelope (node metadata + `payload`).
    Envelope,
}

/// The persisted form of an [`AgentEvent`].
///
/// Conversions to and from events are lossless over the envelope
/// metadata and variant payload, which is what ordered replay relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Which shape this record carries.
    pub record_type: RecordType,

    /// Dotted event type.
    pub event_type: String,

    /// Owning session.
    pub session_id: String,

    /// Owning run.
    pub run_id: String,

    /// Emitting layer.
    pub agent_level: AgentLevel,

    /// Emission time, RFC-3339 with nanoseconds.
    #[serde(with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,

    /// Parent run for subagent events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,

    /// Emitter-assigned sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    // -- Envelope fields --
    /// Envelope schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Workflow id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    /// Node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Node kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_kind: Option<String>,

    /// Whether the event was emitted inside a subtask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_subtask: Option<bool>,

    /// Subtask position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_index: Option<u32>,

    /// Subtask batch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_subtasks: Option<u32>,

    /// Subtask preview text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_preview: Option<String>,

    /// Subtask parallelism cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,

    /// Raw envelope payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,

    // -- Kinded-event fields --
    /// Kind tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Raw structured data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl EventRecord {
    /// Convert an event into its storage record.
    pub fn from_event(event: &AgentEvent) -> Self {
        let meta = event.meta();
        let mut record = Self {
            record_type: RecordType::Event,
            event_type: meta.event_type.clone(),
            session_id: meta.session_id.clone(),
            run_id: meta.run_id.clone(),
            agent_level: meta.agent_level,
            timestamp: meta.timestamp,
            parent_run_id: meta.parent_run_id.clone(),
            seq: Some(meta.seq),
            version: None,
            workflow_id: None,
            node_id: None,
            node_kind: None,
            is_subtask: None,
            subtask_index: None,
            total_subtasks: None,
            subtask_preview: None,
            max_parallel: None,
            payload: None,
            kind: None,
            data: None,
        };

        match event {
            AgentEvent::Envelope(env) => {
                record.record_type = RecordType::Envelope;
                record.version = env.version.clone();
                record.workflow_id = env.workflow_id.clone();
                record.node_id = env.node_id.clone();
                record.node_kind = env.node_kind.clone();
                record.is_subtask = Some(env.is_subtask);
                record.subtask_index = env.subtask_index;
                record.total_subtasks = env.total_subtasks;
                record.subtask_preview = env.subtask_preview.clone();
                record.max_parallel = env.max_parallel;
                record.payload = Some(env.payload.clone());
            }
            AgentEvent::Kinded(kinded) => {
                record.kind = Some(kinded.kind.clone());
                record.data = Some(kinded.data.clone());
            }
        }
        record
    }

    /// Reconstruct the event this record was made from.
    pub fn into_event(self) -> CoreResult<AgentEvent> {
        let meta = EventMeta {
            event_type: self.event_type,
            session_id: self.session_id,
            run_id: self.run_id,
            parent_run_id: self.parent_run_id,
            agent_level: self.agent_level,
            seq: self.seq.unwrap_or(0),
            timestamp: self.timestamp,
        };

        match self.record_type {
            RecordType::Envelope => Ok(AgentEvent::Envelope(WorkflowEnvelope {
                meta,
                version: self.version,
                workflow_id: self.workflow_id,
                node_id: self.node_id,
                node_kind: self.node_kind,
                is_subtask: self.is_subtask.unwrap_or(false),
                subtask_index: self.subtask_index,
                total_subtasks: self.total_subtasks,
                subtask_preview: self.subtask_preview,
                max_parallel: self.max_parallel,
                payload: self.payload.unwrap_or_default(),
            })),
            RecordType::Event => {
                let kind = self.kind.ok_or_else(|| {
                    CoreError::internal("event record missing kind field")
                })?;
                Ok(AgentEvent::Kinded(KindedEvent {
                    meta,
                    kind,
                    data: self.data.unwrap_or(Value::Null),
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EventHistoryStore trait
// ---------------------------------------------------------------------------

/// A batch append failure, reporting how many leading events were
/// durably written so the caller can retry only the unsent tail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("batch append failed after {sent} events: {source}")]
pub struct BatchAppendError {
    /// Number of events written before the failure.
    pub sent: usize,
    /// The underlying failure.
    #[source]
    pub source: CoreError,
}

/// Trait for durable, ordered event history.
///
/// Within a single producer, appended events must be readable back in
/// submission order per session.
#[async_trait]
pub trait EventHistoryStore: Send + Sync {
    /// Append one event.
    async fn append(&self, event: &AgentEvent) -> CoreResult<()>;

    /// Append a batch of events in order.
    ///
    /// The default implementation appends individually and reports the
    /// count sent before a mid-batch failure. Stores with a native batch
    /// capability override this with a single write.
    async fn append_batch(&self, events: &[AgentEvent]) -> Result<(), BatchAppendError> {
        for (sent, event) in events.iter().enumerate() {
            if let Err(source) = self.append(event).await {
                return Err(BatchAppendError { sent, source });
            }
        }
        Ok(())
    }

    /// All records for a session, in append order. An unknown session
    /// yields an empty list.
    async fn stream(&self, session_id: &str) -> CoreResult<Vec<EventRecord>>;

    /// Remove a session's history. Removing an absent session succeeds.
    async fn delete_session(&self, session_id: &str) -> CoreResult<()>;

    /// Whether any events exist for the session.
    async fn has_session_events(&self, session_id: &str) -> CoreResult<bool>;
}
