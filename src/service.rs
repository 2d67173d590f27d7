// Copyright 2025 Cowboy AI, LLC.

//! Wiring for the whole delivery subsystem

use std::sync::Arc;
use tracing::info;

use crate::config::OutboxConfig;
use crate::dispatcher::EventDispatcher;
use crate::errors::OutboxResult;
use crate::handlers::HandlerRegistry;
use crate::infrastructure::{MessageBroker, OutboxStore};
use crate::relay::{OutboxRelay, RelayHandle};
use crate::topics::{managed_topics, TopicRegistry};

/// Running relay and dispatcher sharing one broker client
pub struct EventDeliveryService<B: ?Sized> {
    broker: Arc<B>,
    dispatcher: Arc<EventDispatcher>,
    relay: RelayHandle,
}

impl<B> EventDeliveryService<B>
where
    B: MessageBroker + ?Sized + 'static,
{
    /// Start with the task routing tables
    pub async fn start<S>(store: Arc<S>, broker: Arc<B>, config: &OutboxConfig) -> OutboxResult<Self>
    where
        S: OutboxStore + ?Sized + 'static,
    {
        Self::start_with(
            store,
            broker,
            config,
            TopicRegistry::standard(),
            HandlerRegistry::task_routes(),
        )
        .await
    }

    /// Start with custom routing tables
    ///
    /// Creates the managed topics, subscribes the dispatcher to every routed
    /// topic, then starts the relay loop.
    pub async fn start_with<S>(
        store: Arc<S>,
        broker: Arc<B>,
        config: &OutboxConfig,
        topics: TopicRegistry,
        handlers: HandlerRegistry,
    ) -> OutboxResult<Self>
    where
        S: OutboxStore + ?Sized + 'static,
    {
        config.relay.validate()?;
        broker.ensure_topics(&managed_topics()).await?;

        let dispatcher = Arc::new(EventDispatcher::new(&config.dispatcher, handlers));
        broker.subscribe(&topics.topics(), dispatcher.clone()).await?;

        let relay = OutboxRelay::new(store, broker.clone(), topics, config.relay.clone()).spawn();
        info!("Event delivery started");

        Ok(Self {
            broker,
            dispatcher,
            relay,
        })
    }

    /// The inbound dispatcher
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// The shared broker client
    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Stop the relay after its current cycle, then stop consuming
    pub async fn shutdown(self) -> OutboxResult<()> {
        self.relay.stop().await?;
        self.broker.shutdown().await?;
        info!("Event delivery stopped");
        Ok(())
    }
}
