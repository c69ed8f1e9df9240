//! Postgres-backed event history store.
//!
//! One row per event, ordered by an append sequence column so replay
//! observes submission order. Schema bootstrap runs at construction.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::types::AgentEvent;

use super::{BatchAppendError, EventHistoryStore, EventRecord};

/// PostgreSQL event history store.
///
/// Suitable for multi-node deployments where replay must survive process
/// restarts. Batch appends use a single transaction.
#[derive(Clone)]
pub struct PostgresEventHistoryStore {
    pool: Arc<PgPool>,
}

impl PostgresEventHistoryStore {
    /// Connect and run schema bootstrap.
    pub async fn new(database_url: &str) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::internal(format!("failed to connect to postgres: {}", e)))?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: PgPool) -> CoreResult<Self> {
        let store = Self {
            pool: Arc::new(pool),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_events (
                id BIGSERIAL PRIMARY KEY,
                session_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                seq BIGINT,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| CoreError::internal(format!("failed to create agent_events table: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS agent_events_session_idx ON agent_events (session_id, id)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| CoreError::internal(format!("failed to create session index: {}", e)))?;

        Ok(())
    }

    async fn insert(
        executor: impl sqlx::PgExecutor<'_>,
        record: &EventRecord,
    ) -> CoreResult<()> {
        let json = serde_json::to_value(record)?;
        sqlx::query(
            r#"
            INSERT INTO agent_events (session_id, run_id, event_type, seq, record)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.run_id)
        .bind(&record.event_type)
        .bind(record.seq.map(|s| s as i64))
        .bind(json)
        .execute(executor)
        .await
        .map_err(|e| CoreError::internal(format!("failed to insert event: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl EventHistoryStore for PostgresEventHistoryStore {
    async fn append(&self, event: &AgentEvent) -> CoreResult<()> {
        let record = EventRecord::from_event(event);
        Self::insert(&*self.pool, &record).await
    }

    /// Batch capability: the whole buffer goes through one transaction.
    async fn append_batch(&self, events: &[AgentEvent]) -> Result<(), BatchAppendError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| BatchAppendError {
            sent: 0,
            source: CoreError::internal(format!("failed to begin transaction: {}", e)),
        })?;

        for event in events {
            let record = EventRecord::from_event(event);
            if let Err(source) = Self::insert(&mut *tx, &record).await {
                // The transaction rolls back on drop; nothing was sent.
                return Err(BatchAppendError { sent: 0, source });
            }
        }

        tx.commit().await.map_err(|e| BatchAppendError {
            sent: 0,
            source: CoreError::internal(format!("failed to commit batch: {}", e)),
        })?;
        debug!(count = events.len(), "Batch of events committed");
        Ok(())
    }

    async fn stream(&self, session_id: &str) -> CoreResult<Vec<EventRecord>> {
        let rows = sqlx::query("SELECT record FROM agent_events WHERE session_id = $1 ORDER BY id")
            .bind(session_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| CoreError::internal(format!("failed to read session events: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let json: serde_json::Value = row
                .try_get("record")
                .map_err(|e| CoreError::internal(format!("failed to decode record column: {}", e)))?;
            records.push(serde_json::from_value(json)?);
        }
        Ok(records)
    }

    async fn delete_session(&self, session_id: &str) -> CoreResult<()> {
        sqlx::query("DELETE FROM agent_events WHERE session_id = $1")
            .bind(session_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| CoreError::internal(format!("failed to delete session events: {}", e)))?;
        Ok(())
    }

    async fn has_session_events(&self, session_id: &str) -> CoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM agent_events WHERE session_id = $1)")
                .bind(session_id)
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| {
                    CoreError::internal(format!("failed to check session events: {}", e))
                })?;
        Ok(exists)
    }
}
