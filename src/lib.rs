// Copyright 2025 Cowboy AI, LLC.

//! # Task Outbox
//!
//! Reliable event delivery for the task service: a transactional outbox
//! relay on the producing side and a deduplicating dispatcher on the
//! consuming side.
//!
//! - **Events**: the wire envelope and the task event catalogue
//! - **Outbox store**: claimable table of pending events (in-memory, PostgreSQL)
//! - **Broker**: partitioned, at-least-once message log (in-memory, NATS JetStream)
//! - **Relay**: timer-driven worker moving outbox records to the broker
//! - **Dispatcher**: routes delivered events to handlers, at most once per
//!   event id within its cache window
//!
//! ## Delivery guarantees
//!
//! 1. **At least once**: a record leaves PENDING only after the broker
//!    acknowledged it or it was dead-lettered
//! 2. **Ordered per aggregate**: one aggregate's events share a partition
//!    and are published in creation order
//! 3. **Idempotent consumption**: redelivered event ids are skipped

#![warn(missing_docs)]

pub mod config;
pub mod dedup;
pub mod dispatcher;
mod errors;
pub mod events;
pub mod handlers;
pub mod infrastructure;
pub mod relay;
pub mod service;
pub mod topics;

pub use config::{DispatcherConfig, OutboxConfig, RelayConfig};
pub use dedup::{DedupCache, DEFAULT_DEDUP_CAPACITY};
pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use errors::{OutboxError, OutboxResult};
pub use events::{
    event_types, EventEnvelope, EventId, EventPayload, TaskEvent, TaskSnapshot, TaskStatus,
    TASK_AGGREGATE_TYPE,
};
pub use handlers::{EventHandler, HandlerError, HandlerRegistry, TaskEventLogger};
pub use infrastructure::{
    BrokerError, InMemoryBroker, InMemoryOutboxStore, InboundMessage, MessageBroker,
    MessageHandler, NatsBroker, NatsConfig, OutboundMessage, OutboxRecord, OutboxStatus,
    OutboxStore, StoreError,
};
pub use relay::{OutboxRelay, RelayHandle, RelayReport};
pub use service::EventDeliveryService;
pub use topics::{managed_topics, TopicConfig, TopicRegistry, TASK_EVENTS};
