// Copyright 2025 Cowboy AI, LLC.

//! Outbox table contract and the in-memory implementation
//!
//! The relay is the only writer of record status. The application layer
//! appends PENDING records in the same transaction as its state change; from
//! then on a record moves PENDING → PROCESSING → PROCESSED, back to PENDING
//! after a transient failure, or to FAILED once it is dead-lettered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::events::{EventEnvelope, EventId};

/// `last_error` recorded when the sweeper takes back an abandoned claim
pub const LEASE_EXPIRED_ERROR: &str = "processing lease expired";

/// Errors raised by outbox store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not reach the backing store
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A statement or transaction failed
    #[error("Query error: {0}")]
    QueryError(String),

    /// No record with this id
    #[error("Outbox record not found: {0}")]
    NotFound(EventId),

    /// The record is not currently claimed, so its outcome cannot be written
    #[error("Outbox record {id} is {status}, not PROCESSING")]
    NotClaimed {
        /// Record id
        id: EventId,
        /// Status found instead
        status: OutboxStatus,
    },

    /// An event with this id is already in the outbox
    #[error("Duplicate outbox record: {0}")]
    DuplicateEvent(EventId),

    /// Stored data could not be decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A caller-supplied argument is out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Storage status of an outbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by one relay instance
    Processing,
    /// Published; terminal
    Processed,
    /// Dead-lettered; terminal
    Failed,
}

impl OutboxStatus {
    /// Column representation
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Processed => "PROCESSED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    /// Whether the record will never be claimed again
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Processed | OutboxStatus::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "PROCESSED" => Ok(OutboxStatus::Processed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::SerializationError(format!(
                "unknown outbox status '{other}'"
            ))),
        }
    }
}

/// Persisted outbox row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// The immutable event
    pub envelope: EventEnvelope,
    /// Current storage status
    pub status: OutboxStatus,
    /// Failed publish attempts; never decreases
    pub failure_count: u32,
    /// Most recent failure reason
    pub last_error: Option<String>,
    /// When the record was appended
    pub created_at: DateTime<Utc>,
    /// When the current claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the record was published
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// A fresh PENDING record for an event
    pub fn pending(envelope: EventEnvelope) -> Self {
        Self {
            envelope,
            status: OutboxStatus::Pending,
            failure_count: 0,
            last_error: None,
            created_at: Utc::now(),
            claimed_at: None,
            processed_at: None,
        }
    }

    /// Record id (the event id)
    pub fn id(&self) -> EventId {
        self.envelope.event_id
    }

    fn apply_failure(&mut self, error: &str, max_retries: u32) -> RetryDecision {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.claimed_at = None;
        if self.failure_count >= max_retries {
            self.status = OutboxStatus::Failed;
            RetryDecision::DeadLettered {
                failure_count: self.failure_count,
            }
        } else {
            self.status = OutboxStatus::Pending;
            RetryDecision::Retry {
                failure_count: self.failure_count,
            }
        }
    }
}

/// What happened to a record after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Returned to PENDING for a later poll
    Retry {
        /// Failures so far
        failure_count: u32,
    },
    /// Moved to FAILED; needs operator attention
    DeadLettered {
        /// Failures so far (at least the retry ceiling)
        failure_count: u32,
    },
}

/// Outcome of a stale-claim sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Records returned to PENDING
    pub requeued: usize,
    /// Records that hit the retry ceiling and were dead-lettered
    pub dead_lettered: usize,
}

/// Transactional access to the outbox table
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append PENDING records (application side)
    async fn append(&self, events: Vec<EventEnvelope>) -> Result<(), StoreError>;

    /// Atomically claim up to `limit` PENDING records, oldest first, moving
    /// them to PROCESSING. Rows held by a concurrent claimer are skipped.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Mark a claimed record as published
    async fn mark_processed(&self, id: EventId) -> Result<(), StoreError>;

    /// Count a failed publish; requeue, or dead-letter once `max_retries` is reached
    async fn mark_retry_or_dead(
        &self,
        id: EventId,
        error: &str,
        max_retries: u32,
    ) -> Result<RetryDecision, StoreError>;

    /// Dead-letter a claimed record without retry (configuration errors)
    async fn mark_failed(&self, id: EventId, reason: &str) -> Result<(), StoreError>;

    /// Return a claimed record to PENDING untouched, without counting a failure
    async fn release(&self, id: EventId) -> Result<(), StoreError>;

    /// Take back PROCESSING records claimed longer than `older_than` ago
    async fn reclaim_stale(
        &self,
        older_than: Duration,
        max_retries: u32,
    ) -> Result<ReclaimReport, StoreError>;

    /// Look up a record
    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct OutboxTable {
    // Insertion order doubles as creation order.
    rows: Vec<OutboxRecord>,
    index: HashMap<EventId, usize>,
}

impl OutboxTable {
    fn claimed_mut(&mut self, id: EventId) -> Result<&mut OutboxRecord, StoreError> {
        let position = *self.index.get(&id).ok_or(StoreError::NotFound(id))?;
        let record = &mut self.rows[position];
        if record.status != OutboxStatus::Processing {
            return Err(StoreError::NotClaimed {
                id,
                status: record.status,
            });
        }
        Ok(record)
    }
}

/// In-process outbox table
///
/// Every operation runs under one lock, which gives claims the same
/// disjointness the skip-locked read gives a real database. Clones share the
/// table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    table: Arc<Mutex<OutboxTable>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record in creation order
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.table.lock().await.rows.clone()
    }

    /// Number of records with the given status
    pub async fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.table
            .lock()
            .await
            .rows
            .iter()
            .filter(|r| r.status == status)
            .count()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, events: Vec<EventEnvelope>) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;

        // All-or-nothing, like the surrounding domain transaction.
        let mut incoming = HashSet::with_capacity(events.len());
        for event in &events {
            if table.index.contains_key(&event.event_id) || !incoming.insert(event.event_id) {
                return Err(StoreError::DuplicateEvent(event.event_id));
            }
        }

        for event in events {
            let id = event.event_id;
            let position = table.rows.len();
            table.rows.push(OutboxRecord::pending(event));
            table.index.insert(id, position);
        }
        Ok(())
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut table = self.table.lock().await;
        let now = Utc::now();

        let claimed = table
            .rows
            .iter_mut()
            .filter(|r| r.status == OutboxStatus::Pending)
            .take(limit)
            .map(|record| {
                record.status = OutboxStatus::Processing;
                record.claimed_at = Some(now);
                record.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn mark_processed(&self, id: EventId) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let record = table.claimed_mut(id)?;
        record.status = OutboxStatus::Processed;
        record.processed_at = Some(Utc::now());
        record.claimed_at = None;
        Ok(())
    }

    async fn mark_retry_or_dead(
        &self,
        id: EventId,
        error: &str,
        max_retries: u32,
    ) -> Result<RetryDecision, StoreError> {
        let mut table = self.table.lock().await;
        let record = table.claimed_mut(id)?;
        Ok(record.apply_failure(error, max_retries))
    }

    async fn mark_failed(&self, id: EventId, reason: &str) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let record = table.claimed_mut(id)?;
        record.apply_failure(reason, 0);
        Ok(())
    }

    async fn release(&self, id: EventId) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let record = table.claimed_mut(id)?;
        record.status = OutboxStatus::Pending;
        record.claimed_at = None;
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        older_than: Duration,
        max_retries: u32,
    ) -> Result<ReclaimReport, StoreError> {
        let timeout = chrono::Duration::from_std(older_than)
            .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
        let cutoff = Utc::now() - timeout;

        let mut table = self.table.lock().await;
        let mut report = ReclaimReport::default();

        for record in table.rows.iter_mut() {
            let stale = record.status == OutboxStatus::Processing
                && record.claimed_at.map_or(true, |at| at <= cutoff);
            if !stale {
                continue;
            }
            match record.apply_failure(LEASE_EXPIRED_ERROR, max_retries) {
                RetryDecision::Retry { .. } => report.requeued += 1,
                RetryDecision::DeadLettered { .. } => report.dead_lettered += 1,
            }
        }

        Ok(report)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, StoreError> {
        let table = self.table.lock().await;
        Ok(table.index.get(&id).map(|&position| table.rows[position].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn envelope(aggregate_id: &str) -> EventEnvelope {
        EventEnvelope::new("task.created", "Task", aggregate_id, EventPayload::default())
    }

    async fn seeded(n: usize) -> (InMemoryOutboxStore, Vec<EventId>) {
        let store = InMemoryOutboxStore::new();
        let events: Vec<EventEnvelope> = (0..n).map(|i| envelope(&format!("task-{i}"))).collect();
        let ids = events.iter().map(|e| e.event_id).collect();
        store.append(events).await.unwrap();
        (store, ids)
    }

    #[tokio::test]
    async fn test_claim_is_oldest_first_and_bounded() {
        let (store, ids) = seeded(5).await;

        let claimed = store.claim_batch(3).await.unwrap();
        let claimed_ids: Vec<EventId> = claimed.iter().map(|r| r.id()).collect();

        assert_eq!(claimed_ids, ids[..3].to_vec());
        assert!(claimed.iter().all(|r| r.status == OutboxStatus::Processing));
        assert_eq!(store.count_with_status(OutboxStatus::Pending).await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_claims_partition_pending_set() {
        let (store, ids) = seeded(250).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(7).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|r| r.id()));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "record {id} claimed twice");
                total += 1;
            }
        }

        assert_eq!(total, ids.len());
        assert_eq!(store.count_with_status(OutboxStatus::Pending).await, 0);
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let (store, ids) = seeded(1).await;
        let id = ids[0];

        for attempt in 1..=3u32 {
            store.claim_batch(10).await.unwrap();
            let decision = store.mark_retry_or_dead(id, "broker down", 3).await.unwrap();
            if attempt < 3 {
                assert_eq!(decision, RetryDecision::Retry { failure_count: attempt });
            } else {
                assert_eq!(decision, RetryDecision::DeadLettered { failure_count: 3 });
            }
        }

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.failure_count, 3);
        assert_eq!(record.last_error.as_deref(), Some("broker down"));
        assert!(store.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outcome_requires_claim() {
        let (store, ids) = seeded(1).await;

        let err = store.mark_processed(ids[0]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotClaimed {
                status: OutboxStatus::Pending,
                ..
            }
        ));

        let missing = EventId::new();
        assert!(matches!(
            store.mark_processed(missing).await.unwrap_err(),
            StoreError::NotFound(id) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_mark_failed_counts_attempt() {
        let (store, ids) = seeded(1).await;
        store.claim_batch(1).await.unwrap();

        store.mark_failed(ids[0], "no topic").await.unwrap();

        let record = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test]
    async fn test_reclaim_stale_requeues_abandoned_claims() {
        let (store, ids) = seeded(2).await;
        store.claim_batch(2).await.unwrap();

        let report = store.reclaim_stale(Duration::ZERO, 5).await.unwrap();
        assert_eq!(report, ReclaimReport { requeued: 2, dead_lettered: 0 });

        let record = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
    }

    #[tokio::test]
    async fn test_reclaim_ignores_fresh_claims() {
        let (store, _) = seeded(1).await;
        store.claim_batch(1).await.unwrap();

        let report = store.reclaim_stale(Duration::from_secs(3600), 5).await.unwrap();
        assert_eq!(report, ReclaimReport::default());
        assert_eq!(store.count_with_status(OutboxStatus::Processing).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_append_is_rejected_atomically() {
        let store = InMemoryOutboxStore::new();
        let first = envelope("task-1");
        store.append(vec![first.clone()]).await.unwrap();

        let err = store
            .append(vec![envelope("task-2"), first.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEvent(id) if id == first.event_id));
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_id_within_one_append_is_rejected() {
        let store = InMemoryOutboxStore::new();
        let event = envelope("task-1");

        let err = store
            .append(vec![event.clone(), event.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEvent(id) if id == event.event_id));
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_requeues_without_counting_failure() {
        let (store, ids) = seeded(2).await;
        store.claim_batch(2).await.unwrap();

        store.release(ids[1]).await.unwrap();

        let record = store.get(ids[1]).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.last_error, None);
        assert_eq!(record.claimed_at, None);
        // Only claimed records can be released.
        assert!(matches!(
            store.release(ids[1]).await.unwrap_err(),
            StoreError::NotClaimed { .. }
        ));
    }

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Processed,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<OutboxStatus>().is_err());
    }
}
