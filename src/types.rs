//! Core domain types — tasks, workflow events, and attachments.
//!
//! [`Task`] is the unit of orchestration: one user-initiated agent
//! execution tracked from `pending` through a terminal status.
//! [`AgentEvent`] is the unit of streaming: either a workflow *envelope*
//! with node metadata or a *kinded* event with structured data, both
//! sharing the [`EventMeta`] header. Events are immutable once emitted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Task status and termination
// ============================================================================

/// The lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted but not yet started.
    Pending,
    /// The background worker is executing the task.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped before completion.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal. Terminal tasks never transition
    /// again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a task reached its terminal status.
///
/// `None` exactly while the task is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The task has not terminated.
    #[default]
    None,
    /// Completed with a result.
    Completed,
    /// Cancelled by the user or by lease loss.
    Cancelled,
    /// A deadline elapsed during execution.
    Timeout,
    /// Execution failed.
    Error,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::None => "none",
            TerminationReason::Completed => "completed",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Error => "error",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Task
// ============================================================================

/// The final outcome of a successful task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// The agent's answer to the task.
    pub answer: String,

    /// How many workflow iterations the execution took.
    pub iterations: u32,

    /// Total tokens consumed across the execution.
    pub total_tokens: u64,

    /// Why the agent stopped (e.g. `finished`, `max_iterations`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,

    /// The session the execution ran in.
    pub session_id: String,
}

/// A single user-initiated agent execution.
///
/// Stores hand out copies of this record; the background worker owning the
/// task is the sole mutator of its progress and result fields, and every
/// mutation funnels through the task store's internal lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique opaque identifier, stable for the task's lifetime.
    pub task_id: String,

    /// The owning session.
    pub session_id: String,

    /// Parent task id for subtasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// The natural-language task the user submitted.
    pub description: String,

    /// Agent preset selected for this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_preset: Option<String>,

    /// Tool preset selected for this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_preset: Option<String>,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Why the task terminated. `None` while non-terminal.
    #[serde(default)]
    pub termination_reason: TerminationReason,

    /// Set at creation.
    pub created_at: DateTime<Utc>,

    /// Set once, on the first transition to `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set once, on the first terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Monotonic non-decreasing iteration counter while running.
    #[serde(default)]
    pub current_iteration: u32,

    /// Running token count.
    #[serde(default)]
    pub tokens_used: u64,

    /// Final iteration total, set with the result.
    #[serde(default)]
    pub total_iterations: u32,

    /// Final token total, set with the result.
    #[serde(default)]
    pub total_tokens: u64,

    /// The successful outcome. Mutually exclusive with `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,

    /// The failure message. Mutually exclusive with `result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The process currently holding execution rights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    /// Absolute expiry of the current lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a fresh `pending` task.
    pub fn new(task_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            parent_task_id: None,
            description: String::new(),
            agent_preset: None,
            tool_preset: None,
            status: TaskStatus::Pending,
            termination_reason: TerminationReason::None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_iteration: 0,
            tokens_used: 0,
            total_iterations: 0,
            total_tokens: 0,
            result: None,
            error: None,
            owner_id: None,
            lease_until: None,
        }
    }

    /// Whether the task's status is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a lease is active at `now`.
    pub fn has_active_lease(&self, now: DateTime<Utc>) -> bool {
        match (&self.owner_id, &self.lease_until) {
            (Some(_), Some(until)) => *until > now,
            _ => false,
        }
    }
}

// ============================================================================
// Agent events
// ============================================================================

/// Which layer of the workflow emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentLevel {
    /// The top-level agent.
    #[default]
    Core,
    /// A spawned subagent.
    Subagent,
}

impl fmt::Display for AgentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentLevel::Core => write!(f, "core"),
            AgentLevel::Subagent => write!(f, "subagent"),
        }
    }
}

/// Envelope metadata shared by every streamed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Dotted event type, e.g. `workflow.node.started`.
    pub event_type: String,

    /// The session this event belongs to. The reserved value
    /// [`GLOBAL_SESSION_ID`](crate::utils::constants::GLOBAL_SESSION_ID)
    /// fans out to every registered session.
    pub session_id: String,

    /// The run (task) this event belongs to.
    pub run_id: String,

    /// The parent run for subagent events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,

    /// The emitting layer.
    #[serde(default)]
    pub agent_level: AgentLevel,

    /// Monotonic sequence number assigned by the emitter.
    #[serde(default)]
    pub seq: u64,

    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    /// Build metadata for a new event, stamped now.
    pub fn new(
        event_type: impl Into<String>,
        session_id: impl Into<String>,
        run_id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            session_id: session_id.into(),
            run_id: run_id.into(),
            parent_run_id: None,
            agent_level: AgentLevel::Core,
            seq,
            timestamp: Utc::now(),
        }
    }
}

/// A workflow event carrying node metadata and an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEnvelope {
    /// Shared envelope metadata.
    #[serde(flatten)]
    pub meta: EventMeta,

    /// Envelope schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// The workflow this node belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    /// The emitting node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// The node kind (e.g. `planner`, `tool_call`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_kind: Option<String>,

    /// Whether this event was emitted inside a subtask.
    #[serde(default)]
    pub is_subtask: bool,

    /// Position of the subtask within its batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_index: Option<u32>,

    /// Size of the subtask batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_subtasks: Option<u32>,

    /// Short preview of the subtask description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_preview: Option<String>,

    /// Parallelism cap for the subtask batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,

    /// Opaque event payload.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

/// A diagnostic or terminal event carrying a kind tag and structured data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindedEvent {
    /// Shared envelope metadata.
    #[serde(flatten)]
    pub meta: EventMeta,

    /// The kind tag (e.g. `context_snapshot`, `result_final`).
    pub kind: String,

    /// Structured event data.
    #[serde(default)]
    pub data: Value,
}

/// The unit of streaming — either a workflow envelope or a kinded event.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A workflow event with node metadata.
    Envelope(WorkflowEnvelope),
    /// A kind-tagged event with structured data.
    Kinded(KindedEvent),
}

impl AgentEvent {
    /// The shared envelope metadata.
    pub fn meta(&self) -> &EventMeta {
        match self {
            AgentEvent::Envelope(e) => &e.meta,
            AgentEvent::Kinded(e) => &e.meta,
        }
    }

    /// The dotted event type.
    pub fn event_type(&self) -> &str {
        &self.meta().event_type
    }

    /// The session this event targets.
    pub fn session_id(&self) -> &str {
        &self.meta().session_id
    }

    /// The run (task) this event belongs to.
    pub fn run_id(&self) -> &str {
        &self.meta().run_id
    }

    /// Build a bare envelope event with the given payload.
    pub fn envelope(meta: EventMeta, payload: Map<String, Value>) -> Self {
        AgentEvent::Envelope(WorkflowEnvelope {
            meta,
            version: None,
            workflow_id: None,
            node_id: None,
            node_kind: None,
            is_subtask: false,
            subtask_index: None,
            total_subtasks: None,
            subtask_preview: None,
            max_parallel: None,
            payload,
        })
    }

    /// Build a kinded event.
    pub fn kinded(meta: EventMeta, kind: impl Into<String>, data: Value) -> Self {
        AgentEvent::Kinded(KindedEvent {
            meta,
            kind: kind.into(),
            data,
        })
    }
}

// ============================================================================
// Attachments
// ============================================================================

/// A user-supplied attachment accompanying a task request.
///
/// Inline payloads are subject to the sanitization rules in
/// [`crate::utils::sanitize`] before entering event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Where the attachment content lives. Data URIs are stripped during
    /// sanitization.
    #[serde(default)]
    pub uri: String,

    /// Media type of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Inline base64 content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}
