//! Write-behind event history — batches appends onto a background
//! flusher so the hot streaming path never blocks on storage I/O.
//!
//! Ingress goes through a bounded channel; a single flusher batches
//! writes to the inner store, coalesces explicit flush requests, backs
//! off exponentially on failures, and sheds debug events under queue
//! pressure. Reads (`stream`, `delete_session`, `has_session_events`)
//! force a flush first so replay endpoints observe everything appended
//! before the call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::AgentEvent;
use crate::utils::constants::{
    EVENT_DIAGNOSTIC_PREFIX, EVENT_EXECUTOR_UPDATE, EVENT_EXECUTOR_USER_MESSAGE,
};

use super::{EventHistoryStore, EventRecord};

/// Cap on each inner write.
const INNER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor of the failure backoff.
const BACKOFF_FLOOR: Duration = Duration::from_millis(250);

/// Ceiling of the failure backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Predicate deciding which events are debug/diagnostic and therefore
/// eligible for shedding under queue pressure.
///
/// The default matches the diagnostic event-type prefix plus the two
/// executor chatter types. Substitute any policy at construction.
#[derive(Debug, Clone)]
pub struct DebugEventPolicy {
    /// Event-type prefixes treated as debug.
    pub prefixes: Vec<String>,
    /// Exact event types treated as debug.
    pub exact: Vec<String>,
}

impl Default for DebugEventPolicy {
    fn default() -> Self {
        Self {
            prefixes: vec![EVENT_DIAGNOSTIC_PREFIX.to_string()],
            exact: vec![
                EVENT_EXECUTOR_UPDATE.to_string(),
                EVENT_EXECUTOR_USER_MESSAGE.to_string(),
            ],
        }
    }
}

impl DebugEventPolicy {
    /// Whether an event type is sheddable.
    pub fn is_debug(&self, event_type: &str) -> bool {
        self.exact.iter().any(|t| t == event_type)
            || self.prefixes.iter().any(|p| event_type.starts_with(p.as_str()))
    }
}

/// Configuration for [`AsyncEventHistoryStore`].
#[derive(Debug, Clone)]
pub struct AsyncHistoryConfig {
    /// Flush when the in-memory buffer reaches this many events.
    pub batch_size: usize,

    /// Periodic flush cadence.
    pub flush_interval: Duration,

    /// Max wait when the ingress queue is full.
    pub append_timeout: Duration,

    /// Channel slots for pending events.
    pub queue_capacity: usize,

    /// Bound on events pulled from the queue per flush request.
    /// Defaults to 4× the batch size with a floor of 64.
    pub max_drain_per_flush: Option<usize>,

    /// How long a flush request gathers additional waiters.
    pub coalesce_window: Duration,

    /// Pending-event depth at which debug events start dropping.
    /// Defaults to 80% of the queue capacity.
    pub backpressure_watermark: Option<usize>,

    /// Whether debug events are shed under backpressure.
    pub degrade_debug_events: bool,

    /// Which events count as debug.
    pub debug_policy: DebugEventPolicy,
}

impl Default for AsyncHistoryConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval: Duration::from_millis(250),
            append_timeout: Duration::from_millis(50),
            queue_capacity: 8192,
            max_drain_per_flush: None,
            coalesce_window: Duration::from_millis(8),
            backpressure_watermark: None,
            degrade_debug_events: true,
            debug_policy: DebugEventPolicy::default(),
        }
    }
}

impl AsyncHistoryConfig {
    fn effective_max_drain(&self) -> usize {
        self.max_drain_per_flush
            .unwrap_or_else(|| (self.batch_size * 4).max(64))
    }

    fn effective_watermark(&self) -> usize {
        self.backpressure_watermark
            .unwrap_or_else(|| (self.queue_capacity * 4) / 5)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StatsInner {
    pending: AtomicU64,
    enqueued_events: AtomicU64,
    queue_full_events: AtomicU64,
    flush_batches: AtomicU64,
    flush_failures: AtomicU64,
    flushed_events: AtomicU64,
    debug_events_dropped: AtomicU64,
    flush_requests: AtomicU64,
    flush_requests_coalesced: AtomicU64,
}

/// Snapshot of the async store's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AsyncHistoryStats {
    /// Events accepted but not yet durably flushed.
    pub queue_depth: u64,
    /// Configured channel capacity.
    pub queue_capacity: usize,
    /// Events accepted onto the queue.
    pub enqueued_events: u64,
    /// Appends that timed out against a full queue.
    pub queue_full_events: u64,
    /// Successful batch flushes.
    pub flush_batches: u64,
    /// Failed flush attempts.
    pub flush_failures: u64,
    /// Events durably written.
    pub flushed_events: u64,
    /// Debug events shed under backpressure.
    pub debug_events_dropped: u64,
    /// Explicit flush requests received.
    pub flush_requests: u64,
    /// Flush requests satisfied by another request's flush.
    pub flush_requests_coalesced: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

type FlushReply = oneshot::Sender<CoreResult<()>>;

/// Write-behind wrapper around an inner [`EventHistoryStore`].
///
/// Construct with [`AsyncEventHistoryStore::new`] inside a tokio
/// runtime; the background flusher is spawned immediately. Call
/// [`close`](Self::close) to drain and stop it; close is idempotent.
pub struct AsyncEventHistoryStore {
    inner: Arc<dyn EventHistoryStore>,
    tx: mpsc::Sender<AgentEvent>,
    flush_tx: mpsc::Sender<FlushReply>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    stats: Arc<StatsInner>,
    queue_capacity: usize,
    append_timeout: Duration,
    watermark: usize,
    degrade_debug_events: bool,
    debug_policy: DebugEventPolicy,
}

impl AsyncEventHistoryStore {
    /// Create with default configuration.
    pub fn new(inner: Arc<dyn EventHistoryStore>) -> Self {
        Self::with_config(inner, AsyncHistoryConfig::default())
    }

    /// Create with explicit configuration.
    pub fn with_config(inner: Arc<dyn EventHistoryStore>, config: AsyncHistoryConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (flush_tx, flush_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let stats = Arc::new(StatsInner::default());

        let flusher = Flusher {
            inner: Arc::clone(&inner),
            rx,
            flush_rx,
            shutdown: shutdown.clone(),
            stats: Arc::clone(&stats),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            max_drain: config.effective_max_drain(),
            coalesce_window: config.coalesce_window,
            buffer: Vec::new(),
            consecutive_failures: 0,
            next_flush_at: Instant::now(),
        };
        let worker = tokio::spawn(flusher.run());

        Self {
            inner,
            tx,
            flush_tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            watermark: config.effective_watermark(),
            queue_capacity: config.queue_capacity,
            append_timeout: config.append_timeout,
            degrade_debug_events: config.degrade_debug_events,
            debug_policy: config.debug_policy,
            stats,
        }
    }

    /// Request a flush of everything buffered and await its completion.
    ///
    /// Forced flushes bypass the failure backoff; the flush result
    /// (including inner store errors) is propagated to the caller.
    pub async fn flush(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            // Everything was drained during close.
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.flush_tx
            .send(reply_tx)
            .await
            .map_err(|_| CoreError::unavailable("history flusher stopped"))?;
        reply_rx
            .await
            .map_err(|_| CoreError::unavailable("history flusher dropped the request"))?
    }

    /// Current counters.
    pub fn stats(&self) -> AsyncHistoryStats {
        AsyncHistoryStats {
            queue_depth: self.stats.pending.load(Ordering::Relaxed),
            queue_capacity: self.queue_capacity,
            enqueued_events: self.stats.enqueued_events.load(Ordering::Relaxed),
            queue_full_events: self.stats.queue_full_events.load(Ordering::Relaxed),
            flush_batches: self.stats.flush_batches.load(Ordering::Relaxed),
            flush_failures: self.stats.flush_failures.load(Ordering::Relaxed),
            flushed_events: self.stats.flushed_events.load(Ordering::Relaxed),
            debug_events_dropped: self.stats.debug_events_dropped.load(Ordering::Relaxed),
            flush_requests: self.stats.flush_requests.load(Ordering::Relaxed),
            flush_requests_coalesced: self
                .stats
                .flush_requests_coalesced
                .load(Ordering::Relaxed),
        }
    }

    /// Drain the queue, flush the remainder, and stop the flusher.
    ///
    /// Idempotent: repeated calls return success without further effect.
    pub async fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "History flusher terminated abnormally");
            }
        }
        Ok(())
    }

    fn record_debug_drop(&self, event_type: &str, depth: u64) {
        self.stats.debug_events_dropped.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_type = %event_type,
            queue_depth = depth,
            "Shedding debug event under backpressure"
        );
    }
}

#[async_trait]
impl EventHistoryStore for AsyncEventHistoryStore {
    async fn append(&self, event: &AgentEvent) -> CoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            warn!("History store is closed; event will not be recorded");
            return Ok(());
        }

        let is_debug = self.degrade_debug_events && self.debug_policy.is_debug(event.event_type());

        let depth = self.stats.pending.load(Ordering::Relaxed);
        if is_debug && depth >= self.watermark as u64 {
            self.record_debug_drop(event.event_type(), depth);
            return Ok(());
        }

        match self.tx.try_send(event.clone()) {
            Ok(()) => {
                self.stats.pending.fetch_add(1, Ordering::Relaxed);
                self.stats.enqueued_events.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("History flusher stopped; event will not be recorded");
                return Ok(());
            }
            Err(mpsc::error::TrySendError::Full(returned)) => {
                if is_debug {
                    self.record_debug_drop(event.event_type(), depth);
                    return Ok(());
                }

                // Critical event: wait for a slot, bounded by the append
                // timeout and racing shutdown.
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        Err(CoreError::cancelled("history store shutting down"))
                    }
                    sent = tokio::time::timeout(self.append_timeout, self.tx.send(returned)) => {
                        match sent {
                            Ok(Ok(())) => {
                                self.stats.pending.fetch_add(1, Ordering::Relaxed);
                                self.stats.enqueued_events.fetch_add(1, Ordering::Relaxed);
                                Ok(())
                            }
                            Ok(Err(_)) => {
                                warn!("History flusher stopped; event will not be recorded");
                                Ok(())
                            }
                            Err(_) => {
                                self.stats.queue_full_events.fetch_add(1, Ordering::Relaxed);
                                Err(CoreError::queue_full(format!(
                                    "history queue full ({} slots)",
                                    self.queue_capacity
                                )))
                            }
                        }
                    }
                }
            }
        }
    }

    async fn stream(&self, session_id: &str) -> CoreResult<Vec<EventRecord>> {
        self.flush().await?;
        self.inner.stream(session_id).await
    }

    async fn delete_session(&self, session_id: &str) -> CoreResult<()> {
        self.flush().await?;
        self.inner.delete_session(session_id).await
    }

    async fn has_session_events(&self, session_id: &str) -> CoreResult<bool> {
        self.flush().await?;
        self.inner.has_session_events(session_id).await
    }
}

// ---------------------------------------------------------------------------
// Flusher — the single background worker
// ---------------------------------------------------------------------------

struct Flusher {
    inner: Arc<dyn EventHistoryStore>,
    rx: mpsc::Receiver<AgentEvent>,
    flush_rx: mpsc::Receiver<FlushReply>,
    shutdown: CancellationToken,
    stats: Arc<StatsInner>,
    batch_size: usize,
    flush_interval: Duration,
    max_drain: usize,
    coalesce_window: Duration,
    buffer: Vec<AgentEvent>,
    consecutive_failures: u32,
    next_flush_at: Instant,
}

impl Flusher {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                maybe_event = self.rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.buffer.push(event);
                            if self.buffer.len() >= self.batch_size {
                                let _ = self.try_flush(false).await;
                            }
                        }
                        None => {
                            // All senders gone; final flush and exit.
                            let _ = self.try_flush(true).await;
                            break;
                        }
                    }
                }
                maybe_request = self.flush_rx.recv() => {
                    match maybe_request {
                        Some(request) => self.handle_flush_request(request).await,
                        None => {
                            // Store dropped; drain and exit.
                            self.drain_queue(usize::MAX);
                            let _ = self.try_flush(true).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let _ = self.try_flush(false).await;
                }
                _ = self.shutdown.cancelled() => {
                    self.drain_queue(usize::MAX);
                    if let Err(e) = self.try_flush(true).await {
                        error!(error = %e, buffered = self.buffer.len(), "Final history flush failed");
                    }
                    break;
                }
            }
        }
        debug!("History flusher stopped");
    }

    /// Serve an explicit flush request, gathering waiters that arrive
    /// within the coalesce window so they all share one flush.
    async fn handle_flush_request(&mut self, first: FlushReply) {
        self.stats.flush_requests.fetch_add(1, Ordering::Relaxed);
        let mut waiters = vec![first];

        while let Ok(extra) = self.flush_rx.try_recv() {
            self.stats.flush_requests.fetch_add(1, Ordering::Relaxed);
            self.stats
                .flush_requests_coalesced
                .fetch_add(1, Ordering::Relaxed);
            waiters.push(extra);
        }

        let deadline = Instant::now() + self.coalesce_window;
        loop {
            match tokio::time::timeout_at(deadline, self.flush_rx.recv()).await {
                Ok(Some(extra)) => {
                    self.stats.flush_requests.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .flush_requests_coalesced
                        .fetch_add(1, Ordering::Relaxed);
                    waiters.push(extra);
                }
                Ok(None) | Err(_) => break,
            }
        }

        self.drain_queue(self.max_drain);
        let result = self.try_flush(true).await;
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Pull up to `limit` queued events into the buffer without waiting.
    fn drain_queue(&mut self, limit: usize) {
        let mut drained = 0;
        while drained < limit {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.buffer.push(event);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
    }

    /// Flush the buffer to the inner store.
    ///
    /// Non-forced flushes skip while the failure backoff is in effect;
    /// forced flushes always run and surface the error.
    async fn try_flush(&mut self, forced: bool) -> CoreResult<()> {
        if !forced && Instant::now() < self.next_flush_at {
            return Ok(());
        }
        if self.buffer.is_empty() {
            return Ok(());
        }

        let write = tokio::time::timeout(INNER_WRITE_TIMEOUT, self.inner.append_batch(&self.buffer))
            .await;

        match write {
            Ok(Ok(())) => {
                let flushed = self.buffer.len();
                self.buffer.clear();
                self.stats.flush_batches.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .flushed_events
                    .fetch_add(flushed as u64, Ordering::Relaxed);
                self.stats
                    .pending
                    .fetch_sub(flushed as u64, Ordering::Relaxed);
                self.consecutive_failures = 0;
                self.next_flush_at = Instant::now();
                Ok(())
            }
            Ok(Err(batch_err)) => {
                // Keep only the unsent tail for the next attempt.
                if batch_err.sent > 0 {
                    self.buffer.drain(..batch_err.sent);
                    self.stats
                        .flushed_events
                        .fetch_add(batch_err.sent as u64, Ordering::Relaxed);
                    self.stats
                        .pending
                        .fetch_sub(batch_err.sent as u64, Ordering::Relaxed);
                }
                self.record_failure(&batch_err.source);
                Err(batch_err.source)
            }
            Err(_elapsed) => {
                let err = CoreError::deadline_exceeded(format!(
                    "history flush exceeded {:?}",
                    INNER_WRITE_TIMEOUT
                ));
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn record_failure(&mut self, err: &CoreError) {
        self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let base = self.flush_interval.max(BACKOFF_FLOOR);
        let shift = self.consecutive_failures.saturating_sub(1).min(16);
        let backoff = base
            .saturating_mul(1u32 << shift)
            .min(BACKOFF_CAP);
        self.next_flush_at = Instant::now() + backoff;
        warn!(
            error = %err,
            consecutive_failures = self.consecutive_failures,
            backoff_ms = backoff.as_millis() as u64,
            buffered = self.buffer.len(),
            "History flush failed, backing off"
        );
    }
}
