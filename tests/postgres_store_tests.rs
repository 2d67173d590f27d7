// Copyright 2025 Cowboy AI, LLC.

//! Integration tests for PostgresOutboxStore
//!
//! These tests need a disposable PostgreSQL database; they clear the outbox
//! table. Run with:
//! `OUTBOX_TEST_DATABASE_URL=postgres://localhost/outbox_test cargo test --features postgres`

use std::collections::HashSet;
use std::time::Duration;
use task_outbox::infrastructure::{
    insert_outbox_events, PostgresOutboxStore, RetryDecision, LEASE_EXPIRED_ERROR,
};
use task_outbox::{EventEnvelope, EventId, EventPayload, OutboxStatus, OutboxStore, StoreError};

/// Connect to the test database, or `None` when it is not configured
async fn test_store() -> Option<PostgresOutboxStore> {
    let url = std::env::var("OUTBOX_TEST_DATABASE_URL").ok()?;
    let store = PostgresOutboxStore::connect(&url, 8).await.ok()?;
    store.migrate().await.ok()?;
    sqlx::query("DELETE FROM outbox_events")
        .execute(store.pool())
        .await
        .ok()?;
    Some(store)
}

fn envelope(aggregate_id: &str) -> EventEnvelope {
    EventEnvelope::new("task.created", "Task", aggregate_id, EventPayload::default())
}

// One test body: every step shares the table, so they must not interleave.
#[tokio::test]
async fn test_postgres_outbox_lifecycle() {
    let Some(store) = test_store().await else {
        eprintln!("Skipping test: OUTBOX_TEST_DATABASE_URL not set or unreachable");
        return;
    };

    // Insert inside a caller-owned transaction; nothing is visible before commit.
    let events: Vec<EventEnvelope> = (0..40).map(|i| envelope(&format!("task-{i}"))).collect();
    let mut tx = store.pool().begin().await.unwrap();
    insert_outbox_events(&mut tx, &events).await.unwrap();
    assert!(store.get(events[0].event_id).await.unwrap().is_none());
    tx.commit().await.unwrap();

    let stored = store.get(events[0].event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.envelope.event_type, events[0].event_type);
    assert_eq!(stored.envelope.aggregate_id, events[0].aggregate_id);
    // The column keeps microseconds.
    let drift = stored.envelope.occurred_at - events[0].occurred_at;
    assert!(drift.num_milliseconds().abs() < 1);

    // Concurrent claimers take disjoint batches.
    let claimers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_batch(15).await.unwrap() })
        })
        .collect();
    let mut claimed: Vec<EventId> = Vec::new();
    for claimer in claimers {
        claimed.extend(claimer.await.unwrap().into_iter().map(|r| r.id()));
    }
    let unique: HashSet<EventId> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 40);
    assert_eq!(unique.len(), 40);

    // Outcomes.
    store.mark_processed(events[0].event_id).await.unwrap();
    let processed = store.get(events[0].event_id).await.unwrap().unwrap();
    assert_eq!(processed.status, OutboxStatus::Processed);
    assert!(processed.processed_at.is_some());

    assert!(matches!(
        store.mark_processed(events[0].event_id).await,
        Err(StoreError::NotClaimed { .. })
    ));

    let decision = store
        .mark_retry_or_dead(events[1].event_id, "timeout", 2)
        .await
        .unwrap();
    assert_eq!(decision, RetryDecision::Retry { failure_count: 1 });
    let reclaimed = store.claim_batch(1).await.unwrap();
    assert_eq!(reclaimed[0].id(), events[1].event_id);
    let decision = store
        .mark_retry_or_dead(events[1].event_id, "timeout", 2)
        .await
        .unwrap();
    assert_eq!(decision, RetryDecision::DeadLettered { failure_count: 2 });

    store
        .mark_failed(events[2].event_id, "No topic mapped for aggregate type Unknown")
        .await
        .unwrap();
    let failed = store.get(events[2].event_id).await.unwrap().unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.failure_count, 1);

    // The remaining 37 claims are abandoned; the sweeper returns them.
    let report = store.reclaim_stale(Duration::ZERO, 5).await.unwrap();
    assert_eq!(report.requeued, 37);
    assert_eq!(report.dead_lettered, 0);
    let requeued = store.get(events[3].event_id).await.unwrap().unwrap();
    assert_eq!(requeued.status, OutboxStatus::Pending);
    assert_eq!(requeued.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));

    // Released claims go back untouched.
    let released = store.claim_batch(1).await.unwrap();
    store.release(released[0].id()).await.unwrap();
    let record = store.get(released[0].id()).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Pending);
    assert_eq!(record.failure_count, released[0].failure_count);

    // Events of one domain transaction share created_at; claims keep append order.
    sqlx::query("DELETE FROM outbox_events")
        .execute(store.pool())
        .await
        .unwrap();
    let lifecycle: Vec<EventEnvelope> = ["task.created", "task.updated", "task.status.updated", "task.deleted"]
        .into_iter()
        .map(|event_type| EventEnvelope::new(event_type, "Task", "task-1", EventPayload::default()))
        .collect();
    let mut tx = store.pool().begin().await.unwrap();
    insert_outbox_events(&mut tx, &lifecycle).await.unwrap();
    tx.commit().await.unwrap();

    let claimed = store.claim_batch(10).await.unwrap();
    assert!(claimed.windows(2).all(|w| w[0].created_at == w[1].created_at));
    let order: Vec<EventId> = claimed.iter().map(|r| r.id()).collect();
    let expected: Vec<EventId> = lifecycle.iter().map(|e| e.event_id).collect();
    assert_eq!(order, expected);
}
