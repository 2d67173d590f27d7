// Copyright 2025 Cowboy AI, LLC.

//! Inbound event dispatcher
//!
//! Decodes each delivered message, drops event ids it has already seen and
//! routes the rest by event type. Nothing here returns an error to the
//! broker: malformed, duplicate and unrouted messages are logged and
//! skipped, and the consumer commits past them.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::DispatcherConfig;
use crate::dedup::DedupCache;
use crate::events::EventEnvelope;
use crate::handlers::HandlerRegistry;
use crate::infrastructure::{InboundMessage, MessageHandler};

/// What happened to one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Routed to its handler, which succeeded
    Handled,
    /// Event id already dispatched by this instance
    Duplicate,
    /// Body is not an event envelope
    Malformed,
    /// No handler for the event type
    Unrouted,
    /// The handler returned an error
    HandlerFailed,
}

/// Deduplicating router from delivered messages to event handlers
#[derive(Debug)]
pub struct EventDispatcher {
    seen: Mutex<DedupCache>,
    handlers: HandlerRegistry,
}

impl EventDispatcher {
    /// Create a dispatcher with its own dedup cache
    pub fn new(config: &DispatcherConfig, handlers: HandlerRegistry) -> Self {
        Self {
            seen: Mutex::new(DedupCache::new(config.dedup_capacity)),
            handlers,
        }
    }

    /// Dispatcher for the task events with default settings
    pub fn for_tasks() -> Self {
        Self::new(&DispatcherConfig::default(), HandlerRegistry::task_routes())
    }

    /// The routing table
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Number of event ids currently remembered
    pub async fn remembered(&self) -> usize {
        self.seen.lock().await.len()
    }

    /// Decode, deduplicate and route one message body
    pub async fn dispatch(&self, topic: &str, body: &[u8]) -> DispatchOutcome {
        let event = match EventEnvelope::from_json_bytes(body) {
            Ok(event) => event,
            Err(e) => {
                error!(topic, error = %e, "Dropping malformed event");
                return DispatchOutcome::Malformed;
            }
        };

        // Check and insert under one lock so concurrent copies cannot both pass.
        if !self.seen.lock().await.insert(event.event_id) {
            debug!(topic, event_id = %event.event_id, event_type = %event.event_type, "Skipping duplicate event");
            return DispatchOutcome::Duplicate;
        }

        let Some(handler) = self.handlers.get(&event.event_type) else {
            warn!(topic, event_id = %event.event_id, event_type = %event.event_type, "No handler for event type");
            return DispatchOutcome::Unrouted;
        };

        match handler.handle(&event).await {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) => {
                error!(
                    topic,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Event handler failed"
                );
                DispatchOutcome::HandlerFailed
            }
        }
    }
}

#[async_trait]
impl MessageHandler for EventDispatcher {
    async fn handle(&self, topic: &str, message: &InboundMessage) {
        self.dispatch(topic, &message.value).await;
    }
}
