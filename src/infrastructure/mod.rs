// Copyright 2025 Cowboy AI, LLC.

//! Infrastructure layer
//!
//! This module contains the storage and messaging adapters:
//! - Outbox store contract with in-memory and PostgreSQL tables
//! - Broker client contract with in-memory and NATS JetStream brokers

pub mod broker;
pub mod in_memory_broker;
pub mod nats_broker;
pub mod outbox_store;
/// PostgreSQL outbox table (requires the `postgres` feature)
#[cfg(feature = "postgres")]
pub mod postgres_store;

pub use broker::{
    connect_with_retry, BrokerError, ConnectRetry, InboundMessage, MessageBroker, MessageHandler,
    OutboundMessage, AGGREGATE_TYPE_HEADER, EVENT_TYPE_HEADER,
};
pub use in_memory_broker::InMemoryBroker;
pub use nats_broker::{NatsBroker, NatsConfig};
pub use outbox_store::{
    InMemoryOutboxStore, OutboxRecord, OutboxStatus, OutboxStore, ReclaimReport, RetryDecision,
    StoreError, LEASE_EXPIRED_ERROR,
};
#[cfg(feature = "postgres")]
pub use postgres_store::{insert_outbox_events, PostgresOutboxStore};
