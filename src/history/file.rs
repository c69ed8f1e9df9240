//! File-based event history — one JSONL file per session.
//!
//! Each session's events live at `{dir}/events/{session}.jsonl`, one
//! record per line. Suitable for development and single-node
//! deployments; external tools can tail the files directly.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::AgentEvent;

use super::{BatchAppendError, EventHistoryStore, EventRecord};

/// Replace path-traversal characters in a session id before it becomes a
/// filename.
pub fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .replace("..", "_")
        .replace(['/', '\\'], "_")
}

/// Event history store writing per-session JSONL files.
///
/// Appends are serialized by an internal lock so interleaved producers
/// cannot split a line. Unparseable lines are logged and skipped on
/// read rather than failing the whole stream.
#[derive(Debug)]
pub struct FileEventHistoryStore {
    events_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEventHistoryStore {
    /// Create a store rooted at `dir`; events land in `{dir}/events/`.
    ///
    /// Creates the directory if it doesn't exist.
    pub async fn new(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let events_dir = dir.into().join("events");
        fs::create_dir_all(&events_dir).await.map_err(|e| {
            CoreError::internal(format!("failed to create events directory: {}", e))
        })?;
        Ok(Self {
            events_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.events_dir
            .join(format!("{}.jsonl", sanitize_session_id(session_id)))
    }

    async fn append_lines(&self, session_id: &str, lines: &[u8]) -> CoreResult<()> {
        let path = self.session_path(session_id);
        let _guard = self.write_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| CoreError::internal(format!("failed to open {:?}: {}", path, e)))?;
        file.write_all(lines)
            .await
            .map_err(|e| CoreError::internal(format!("failed to append to {:?}: {}", path, e)))?;
        file.flush()
            .await
            .map_err(|e| CoreError::internal(format!("failed to flush {:?}: {}", path, e)))?;
        Ok(())
    }

    fn encode(event: &AgentEvent) -> CoreResult<Vec<u8>> {
        let mut line = serde_json::to_vec(&EventRecord::from_event(event))?;
        line.push(b'\n');
        Ok(line)
    }
}

#[async_trait]
impl EventHistoryStore for FileEventHistoryStore {
    async fn append(&self, event: &AgentEvent) -> CoreResult<()> {
        let line = Self::encode(event)?;
        self.append_lines(event.session_id(), &line).await
    }

    /// Batch capability: consecutive events of the same session are
    /// written as one buffer.
    async fn append_batch(&self, events: &[AgentEvent]) -> Result<(), BatchAppendError> {
        let mut sent = 0;
        while sent < events.len() {
            let session_id = events[sent].session_id().to_string();
            let run: Vec<&AgentEvent> = events[sent..]
                .iter()
                .take_while(|e| e.session_id() == session_id)
                .collect();

            let mut buffer = Vec::new();
            for event in &run {
                match Self::encode(event) {
                    Ok(line) => buffer.extend_from_slice(&line),
                    Err(source) => return Err(BatchAppendError { sent, source }),
                }
            }
            if let Err(source) = self.append_lines(&session_id, &buffer).await {
                return Err(BatchAppendError { sent, source });
            }
            sent += run.len();
        }
        Ok(())
    }

    async fn stream(&self, session_id: &str) -> CoreResult<Vec<EventRecord>> {
        let path = self.session_path(session_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CoreError::internal(format!(
                    "failed to read {:?}: {}",
                    path, e
                )))
            }
        };

        let mut records = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = ?path, line = line_no + 1, error = %e, "Skipping unparseable history line");
                }
            }
        }
        debug!(session_id = %session_id, count = records.len(), "Streamed session history");
        Ok(records)
    }

    async fn delete_session(&self, session_id: &str) -> CoreResult<()> {
        let path = self.session_path(session_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(session_id = %session_id, "Session history deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::internal(format!(
                "failed to delete {:?}: {}",
                path, e
            ))),
        }
    }

    async fn has_session_events(&self, session_id: &str) -> CoreResult<bool> {
        let path = self.session_path(session_id);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len() > 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::internal(format!(
                "failed to stat {:?}: {}",
                path, e
            ))),
        }
    }
}
