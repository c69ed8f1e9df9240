//! Well-known event types and reserved identifiers.

/// Emitted synchronously before a task is created, carrying the user's
/// request and sanitized attachments. Replay history for a run starts
/// with this event.
pub const EVENT_WORKFLOW_INPUT_RECEIVED: &str = "workflow.input.received";

/// A workflow node began executing.
pub const EVENT_WORKFLOW_NODE_STARTED: &str = "workflow.node.started";

/// A workflow node finished executing.
pub const EVENT_WORKFLOW_NODE_COMPLETED: &str = "workflow.node.completed";

/// The final result of a run.
pub const EVENT_WORKFLOW_RESULT_FINAL: &str = "workflow.result.final";

/// A run was cancelled before producing a result.
pub const EVENT_WORKFLOW_RESULT_CANCELLED: &str = "workflow.result.cancelled";

/// Synthetic envelope sent to a subscriber whose sink overflowed. Carries
/// `dropped_event_type` and `total_drops` in its payload.
pub const EVENT_STREAM_DROPPED: &str = "stream.dropped";

/// Prefix shared by diagnostic events, which are eligible for shedding
/// under ingress queue pressure.
pub const EVENT_DIAGNOSTIC_PREFIX: &str = "workflow.diagnostic.";

/// Diagnostic snapshot of the agent's context window.
pub const EVENT_DIAGNOSTIC_CONTEXT_SNAPSHOT: &str = "workflow.diagnostic.context_snapshot";

/// Incremental executor status update. Sheddable under queue pressure.
pub const EVENT_EXECUTOR_UPDATE: &str = "executor.update";

/// Echo of a user message observed by the executor. Sheddable under queue
/// pressure.
pub const EVENT_EXECUTOR_USER_MESSAGE: &str = "executor.user_message";

/// Reserved session id that fans an event out to every registered
/// session.
pub const GLOBAL_SESSION_ID: &str = "global";
