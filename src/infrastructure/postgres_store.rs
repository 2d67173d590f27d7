// Copyright 2025 Cowboy AI, LLC.

//! PostgreSQL outbox store
//!
//! Claims use `SELECT ... FOR UPDATE SKIP LOCKED` so several relay processes
//! can drain the same table, each taking a disjoint set of rows. The claim
//! transaction only flips rows to PROCESSING; publishing happens after it
//! commits so broker latency never holds row locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::outbox_store::{
    OutboxRecord, OutboxStatus, OutboxStore, ReclaimReport, RetryDecision, StoreError,
    LEASE_EXPIRED_ERROR,
};
use crate::events::{EventEnvelope, EventId, EventPayload};

const SCHEMA: &str = include_str!("../../migrations/0001_create_outbox_events.sql");

const RECORD_COLUMNS: &str = "id, seq, event_type, aggregate_id, aggregate_type, occurred_at, payload, \
     status, failure_count, last_error, created_at, claimed_at, processed_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::ConnectionError(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::SerializationError(err.to_string())
            }
            other => StoreError::QueryError(other.to_string()),
        }
    }
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: Uuid,
    seq: i64,
    event_type: String,
    aggregate_id: String,
    aggregate_type: String,
    occurred_at: DateTime<Utc>,
    payload: Json<EventPayload>,
    status: String,
    failure_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxRecord {
            envelope: EventEnvelope {
                event_id: EventId::from_uuid(row.id),
                event_type: row.event_type,
                aggregate_id: row.aggregate_id,
                aggregate_type: row.aggregate_type,
                occurred_at: row.occurred_at,
                payload: row.payload.0,
            },
            status: row.status.parse()?,
            failure_count: u32::try_from(row.failure_count).map_err(|_| {
                StoreError::SerializationError(format!(
                    "negative failure_count {}",
                    row.failure_count
                ))
            })?,
            last_error: row.last_error,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            processed_at: row.processed_at,
        })
    }
}

/// Insert events into the outbox inside the caller's domain transaction
pub async fn insert_outbox_events(
    tx: &mut Transaction<'_, Postgres>,
    events: &[EventEnvelope],
) -> Result<(), StoreError> {
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, event_type, aggregate_id, aggregate_type, occurred_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.event_id.0)
        .bind(&event.event_type)
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(event.occurred_at)
        .bind(Json(&event.payload))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Outbox store backed by the `outbox_events` table
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionError(format!("Failed to connect: {e}")))?;
        info!(max_connections, "Connected outbox store");
        Ok(Self { pool })
    }

    /// Create the table and indexes when missing
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool, for opening domain transactions
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn not_claimed(&self, id: EventId) -> StoreError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await;

        match status {
            Ok(Some(status)) => match status.parse::<OutboxStatus>() {
                Ok(status) => StoreError::NotClaimed { id, status },
                Err(e) => e,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e.into(),
        }
    }
}

fn decision_from(status: &str, failure_count: i32) -> Result<RetryDecision, StoreError> {
    let failure_count = u32::try_from(failure_count).unwrap_or_default();
    match status.parse::<OutboxStatus>()? {
        OutboxStatus::Failed => Ok(RetryDecision::DeadLettered { failure_count }),
        _ => Ok(RetryDecision::Retry { failure_count }),
    }
}

fn retry_ceiling(max_retries: u32) -> i32 {
    i32::try_from(max_retries).unwrap_or(i32::MAX)
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, events: Vec<EventEnvelope>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_outbox_events(&mut tx, &events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let limit = i64::try_from(limit).map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM outbox_events
            WHERE status = 'PENDING'
            ORDER BY created_at ASC, seq ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "UPDATE outbox_events SET status = 'PROCESSING', claimed_at = now() \
             WHERE id = ANY($1) RETURNING {RECORD_COLUMNS}"
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        // Locks are released here; publishing happens after commit.
        tx.commit().await?;

        // RETURNING order is unspecified.
        rows.sort_by_key(|row| (row.created_at, row.seq));
        let records = rows
            .into_iter()
            .map(OutboxRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(claimed = records.len(), "Claimed outbox batch");
        Ok(records)
    }

    async fn mark_processed(&self, id: EventId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PROCESSED', processed_at = now(), claimed_at = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_claimed(id).await);
        }
        Ok(())
    }

    async fn mark_retry_or_dead(
        &self,
        id: EventId,
        error: &str,
        max_retries: u32,
    ) -> Result<RetryDecision, StoreError> {
        let row: Option<(String, i32)> = sqlx::query_as(
            r#"
            UPDATE outbox_events
            SET failure_count = failure_count + 1,
                last_error = $2,
                claimed_at = NULL,
                status = CASE WHEN failure_count + 1 >= $3 THEN 'FAILED' ELSE 'PENDING' END
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING status, failure_count
            "#,
        )
        .bind(id.0)
        .bind(error)
        .bind(retry_ceiling(max_retries))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((status, failure_count)) => decision_from(&status, failure_count),
            None => Err(self.not_claimed(id).await),
        }
    }

    async fn mark_failed(&self, id: EventId, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'FAILED',
                failure_count = failure_count + 1,
                last_error = $2,
                claimed_at = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.0)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_claimed(id).await);
        }
        Ok(())
    }

    async fn release(&self, id: EventId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'PENDING', claimed_at = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.not_claimed(id).await);
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        older_than: Duration,
        max_retries: u32,
    ) -> Result<ReclaimReport, StoreError> {
        let statuses: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET failure_count = failure_count + 1,
                last_error = $1,
                claimed_at = NULL,
                status = CASE WHEN failure_count + 1 >= $2 THEN 'FAILED' ELSE 'PENDING' END
            WHERE status = 'PROCESSING'
              AND claimed_at <= now() - make_interval(secs => $3)
            RETURNING status
            "#,
        )
        .bind(LEASE_EXPIRED_ERROR)
        .bind(retry_ceiling(max_retries))
        .bind(older_than.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let dead_lettered = statuses.iter().filter(|s| s.as_str() == "FAILED").count();
        Ok(ReclaimReport {
            requeued: statuses.len() - dead_lettered,
            dead_lettered,
        })
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, StoreError> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxRecord::try_from).transpose()
    }
}
