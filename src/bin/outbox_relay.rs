// Copyright 2025 Cowboy AI, LLC.

//! Outbox relay process
//!
//! Drains the PostgreSQL outbox into NATS JetStream and dispatches task
//! events consumed back from the broker. Configured from the environment;
//! runs until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use task_outbox::infrastructure::PostgresOutboxStore;
use task_outbox::{managed_topics, EventDeliveryService, NatsBroker, OutboxConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DB_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OutboxConfig::from_env().context("invalid configuration")?;
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let store = PostgresOutboxStore::connect(&database_url, DB_MAX_CONNECTIONS)
        .await
        .context("failed to connect to the outbox database")?;
    store.migrate().await.context("failed to create the outbox table")?;

    let broker = NatsBroker::connect(config.nats.clone(), &managed_topics())
        .await
        .context("failed to connect to the broker")?;

    let service = EventDeliveryService::start(Arc::new(store), Arc::new(broker), &config).await?;
    info!(
        servers = %config.nats.servers.join(","),
        group = %config.nats.consumer_group,
        "Outbox relay running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    service.shutdown().await?;
    Ok(())
}
