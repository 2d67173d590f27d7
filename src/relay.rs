// Copyright 2025 Cowboy AI, LLC.

//! Outbox relay
//!
//! A single worker wakes on a fixed period, claims a batch of PENDING outbox
//! records, publishes each one and writes its outcome back. A tick that
//! arrives while a cycle is still running is dropped, so cycles never
//! overlap inside one relay. Several relay processes may share a store; the
//! store's claim keeps their batches disjoint.
//!
//! Within a batch records are published one after another in creation
//! order. Once a publish fails, the aggregate's later records in the batch
//! are released back to PENDING unpublished, so they go out behind the
//! failed one and never overtake it on the partition.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::errors::OutboxResult;
use crate::infrastructure::{
    MessageBroker, OutboundMessage, OutboxRecord, OutboxStore, RetryDecision,
};
use crate::topics::TopicRegistry;

/// Counts from one relay cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Records claimed this cycle
    pub claimed: usize,
    /// Records published and marked PROCESSED
    pub published: usize,
    /// Records returned to PENDING after a failed publish
    pub retried: usize,
    /// Records that reached the failure ceiling
    pub dead_lettered: usize,
    /// Records with no topic for their aggregate type
    pub misconfigured: usize,
    /// Records held back behind a failed publish of the same aggregate
    pub deferred: usize,
    /// Stale claims returned by the sweeper (requeued or dead-lettered)
    pub reclaimed: usize,
}

impl RelayReport {
    /// Whether the cycle did nothing at all
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Moves outbox records to the broker
pub struct OutboxRelay<S: ?Sized, B: ?Sized> {
    store: Arc<S>,
    broker: Arc<B>,
    topics: TopicRegistry,
    config: RelayConfig,
}

impl<S, B> OutboxRelay<S, B>
where
    S: OutboxStore + ?Sized + 'static,
    B: MessageBroker + ?Sized + 'static,
{
    /// Create a relay over a store and a broker
    pub fn new(store: Arc<S>, broker: Arc<B>, topics: TopicRegistry, config: RelayConfig) -> Self {
        Self {
            store,
            broker,
            topics,
            config,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run one cycle: sweep stale claims, claim a batch, publish it
    ///
    /// Only a failing sweep or claim is returned as an error. Per-record
    /// failures are written to the store and counted in the report.
    pub async fn run_once(&self) -> OutboxResult<RelayReport> {
        let mut report = RelayReport::default();

        if let Some(timeout) = self.config.processing_timeout() {
            let reclaimed = self.store.reclaim_stale(timeout, self.config.max_retries).await?;
            report.reclaimed = reclaimed.requeued + reclaimed.dead_lettered;
            report.dead_lettered += reclaimed.dead_lettered;
            if report.reclaimed > 0 {
                warn!(
                    requeued = reclaimed.requeued,
                    dead_lettered = reclaimed.dead_lettered,
                    "Reclaimed stale outbox claims"
                );
            }
        }

        let batch = self.store.claim_batch(self.config.batch_size).await?;
        report.claimed = batch.len();

        let mut blocked: HashSet<String> = HashSet::new();
        for record in batch {
            if blocked.contains(&record.envelope.aggregate_id) {
                self.defer_record(&record, &mut report).await;
                continue;
            }
            if !self.relay_record(&record, &mut report).await {
                blocked.insert(record.envelope.aggregate_id.clone());
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                published = report.published,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                misconfigured = report.misconfigured,
                deferred = report.deferred,
                "Outbox cycle complete"
            );
        }
        Ok(report)
    }

    /// Publish one record; false when it did not reach the broker
    async fn relay_record(&self, record: &OutboxRecord, report: &mut RelayReport) -> bool {
        let event = &record.envelope;

        let Some(topic) = self.topics.topic_for(&event.aggregate_type) else {
            let reason = format!("No topic mapped for aggregate type {}", event.aggregate_type);
            error!(
                event_id = %event.event_id,
                aggregate_type = %event.aggregate_type,
                "DEAD LETTER: {reason}"
            );
            match self.store.mark_failed(event.event_id, &reason).await {
                Ok(()) => report.misconfigured += 1,
                Err(e) => error!(event_id = %event.event_id, error = %e, "Failed to record outbox failure"),
            }
            return false;
        };

        let published = match OutboundMessage::for_event(topic, event) {
            Ok(message) => self.broker.produce(message).await.map_err(|e| e.to_string()),
            Err(e) => Err(format!("Failed to encode event: {e}")),
        };

        match published {
            Ok(()) => {
                match self.store.mark_processed(event.event_id).await {
                    Ok(()) => {
                        debug!(event_id = %event.event_id, topic, "Published outbox event");
                        report.published += 1;
                    }
                    // Already on the broker; the claim will be swept and republished.
                    Err(e) => error!(event_id = %event.event_id, error = %e, "Failed to mark outbox event processed"),
                }
                true
            }
            Err(reason) => {
                self.record_failure(record, &reason, report).await;
                false
            }
        }
    }

    async fn defer_record(&self, record: &OutboxRecord, report: &mut RelayReport) {
        let event = &record.envelope;
        match self.store.release(event.event_id).await {
            Ok(()) => {
                debug!(
                    event_id = %event.event_id,
                    aggregate_id = %event.aggregate_id,
                    "Held back behind a failed publish"
                );
                report.deferred += 1;
            }
            // Still PROCESSING; the sweeper takes it back if enabled.
            Err(e) => error!(event_id = %event.event_id, error = %e, "Failed to release outbox record"),
        }
    }

    async fn record_failure(&self, record: &OutboxRecord, reason: &str, report: &mut RelayReport) {
        let event = &record.envelope;
        match self
            .store
            .mark_retry_or_dead(event.event_id, reason, self.config.max_retries)
            .await
        {
            Ok(RetryDecision::Retry { failure_count }) => {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    failure_count,
                    max_retries = self.config.max_retries,
                    error = reason,
                    "Publish failed, will retry"
                );
                report.retried += 1;
            }
            Ok(RetryDecision::DeadLettered { failure_count }) => {
                error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    failure_count,
                    error = reason,
                    "DEAD LETTER: giving up after {failure_count} failed publishes"
                );
                report.dead_lettered += 1;
            }
            Err(e) => error!(event_id = %event.event_id, error = %e, "Failed to record outbox failure"),
        }
    }

    /// Poll until `stop` flips to true
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Outbox cycle failed");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Outbox relay stopped");
    }

    /// Run the poll loop on a background task
    pub fn spawn(self) -> RelayHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(stop_rx).await });
        RelayHandle { stop, task }
    }
}

/// Handle to a relay running in the background
#[derive(Debug)]
pub struct RelayHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Signal the loop and wait for the in-flight cycle to finish
    pub async fn stop(self) -> OutboxResult<()> {
        let _ = self.stop.send(true);
        self.task.await?;
        Ok(())
    }
}
