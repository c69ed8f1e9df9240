//! # agentd-core — task orchestration core for agentic LLM workflow servers
//!
//! This crate coordinates the lifecycle of *tasks* (long-running agent
//! executions spawned by users), fans workflow events out to streaming
//! subscribers, and durably records an append-only event history for
//! later replay.
//!
//! ## Overview
//!
//! Four tightly coupled subsystems form the core:
//!
//! - **Task execution service** ([`service::TaskExecutionService`]) —
//!   admission-controlled asynchronous execution with per-process leases
//!   for single-writer ownership under horizontal scale, cancellation,
//!   progress tracking, and crash-recovery resumption.
//! - **Task store** ([`store::TaskStore`], [`store::InMemoryTaskStore`]) —
//!   map-keyed task records with TTL eviction, lease primitives, and
//!   optional atomic-rename file persistence.
//! - **Event broadcaster** ([`events::EventBroadcaster`]) — non-blocking
//!   fan-out to per-session subscribers with drop-and-notify
//!   backpressure and a bounded per-session history ring.
//! - **Async event history** ([`history::AsyncEventHistoryStore`]) — a
//!   write-behind layer batching event writes onto a background flusher,
//!   coalescing flush requests, shedding debug events under queue
//!   pressure, and guaranteeing flush-before-read for replay.
//!
//! The agent executor itself is an injected dependency
//! ([`service::AgentExecutor`]): it takes a task description and a
//! session, emits events through an [`events::EventListener`], and
//! returns the result. HTTP routing, authentication, and session storage
//! live outside this crate.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agentd_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> CoreResult<()> {
//!     let store = Arc::new(InMemoryTaskStore::new());
//!     let broadcaster = Arc::new(EventBroadcaster::new());
//!     let file_store = Arc::new(FileEventHistoryStore::new("./data").await?);
//!     let history = Arc::new(AsyncEventHistoryStore::new(file_store));
//!
//!     let service = TaskExecutionService::new(
//!         store,
//!         Arc::new(MyAgentExecutor),
//!         ExecutionConfig::default(),
//!     )
//!     .with_broadcaster(broadcaster.clone())
//!     .with_history(history.clone());
//!
//!     let resumed = service.resume_pending_tasks().await?;
//!     println!("resumed {resumed} tasks");
//!
//!     let task = service
//!         .execute_task_async(ExecuteTaskRequest {
//!             description: "Summarize the quarterly report".to_string(),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("task {} is {}", task.task_id, task.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery semantics
//!
//! Event delivery to subscribers is best-effort: a full subscriber sink
//! drops the event and receives a synthetic `stream.dropped` envelope.
//! Durable history preserves submission order per session; the
//! write-behind layer forces a flush before every read so replay
//! observes everything appended before the call.

pub mod error;
pub mod events;
pub mod history;
pub mod replay;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

/// Prelude module that re-exports the commonly used types and traits.
///
/// Import with `use agentd_core::prelude::*;`.
pub mod prelude {
    pub use crate::error::{CoreError, CoreResult};
    pub use crate::events::{
        EventBroadcaster, EventListener, EventSink, HistoryFilter, MultiEventListener,
    };
    pub use crate::history::{
        AsyncEventHistoryStore, AsyncHistoryConfig, EventHistoryStore, EventRecord,
        FileEventHistoryStore,
    };
    pub use crate::replay::{JournalReader, ReplayService, SnapshotStateStore};
    pub use crate::service::{
        AgentExecutor, AnalyticsSink, ExecuteTaskRequest, ExecutionConfig, ExecutionContext,
        TaskExecutionService,
    };
    pub use crate::store::{InMemoryTaskStore, TaskStore, TaskStoreConfig};
    pub use crate::types::{
        AgentEvent, AgentLevel, Attachment, EventMeta, Task, TaskResult, TaskStatus,
        TerminationReason,
    };
}

// Re-export the core types at the crate root for convenience.
pub use error::{CoreError, CoreResult};
pub use types::*;
