// Copyright 2025 Cowboy AI, LLC.

//! Event handlers and the `event_type → handler` routing table

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::events::{event_types, EventEnvelope, TaskSnapshot};

/// Errors a handler can report
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload does not have the shape the event type promises
    #[error("Invalid payload for {event_type}: {reason}")]
    InvalidPayload {
        /// Event type being handled
        event_type: String,
        /// What was wrong
        reason: String,
    },

    /// The handler's side effect failed
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Trait for handling inbound events of one type
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one deduplicated event
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Which sides of the payload an event type carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sides {
    After,
    Both,
    Before,
}

/// Logs the task state transition carried by a task event
#[derive(Debug, Clone)]
pub struct TaskEventLogger {
    event_type: &'static str,
    sides: Sides,
}

impl TaskEventLogger {
    /// Handler for `task.created`
    pub fn created() -> Self {
        Self {
            event_type: event_types::TASK_CREATED,
            sides: Sides::After,
        }
    }

    /// Handler for `task.updated`
    pub fn updated() -> Self {
        Self {
            event_type: event_types::TASK_UPDATED,
            sides: Sides::Both,
        }
    }

    /// Handler for `task.status.updated`
    pub fn status_updated() -> Self {
        Self {
            event_type: event_types::TASK_STATUS_UPDATED,
            sides: Sides::Both,
        }
    }

    /// Handler for `task.deleted`
    pub fn deleted() -> Self {
        Self {
            event_type: event_types::TASK_DELETED,
            sides: Sides::Before,
        }
    }

    /// The event type this handler is registered under
    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    fn snapshot(
        &self,
        side: &str,
        value: Option<&serde_json::Value>,
        required: bool,
    ) -> Result<Option<TaskSnapshot>, HandlerError> {
        let invalid = |reason: String| HandlerError::InvalidPayload {
            event_type: self.event_type.to_string(),
            reason,
        };
        match value {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| invalid(format!("{side}: {e}"))),
            None if required => Err(invalid(format!("missing {side} snapshot"))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EventHandler for TaskEventLogger {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let before = self.snapshot(
            "before",
            event.payload.before.as_ref(),
            self.sides != Sides::After,
        )?;
        let after = self.snapshot(
            "after",
            event.payload.after.as_ref(),
            self.sides != Sides::Before,
        )?;

        match (&before, &after) {
            (None, Some(after)) => info!(
                event_id = %event.event_id,
                task_id = %event.aggregate_id,
                title = %after.title,
                status = %after.status,
                "Task created"
            ),
            (Some(before), Some(after)) if before.status != after.status => info!(
                event_id = %event.event_id,
                task_id = %event.aggregate_id,
                from = %before.status,
                to = %after.status,
                "Task status changed"
            ),
            (Some(before), Some(after)) => info!(
                event_id = %event.event_id,
                task_id = %event.aggregate_id,
                before = ?before,
                after = ?after,
                "Task updated"
            ),
            (Some(before), None) => info!(
                event_id = %event.event_id,
                task_id = %event.aggregate_id,
                title = %before.title,
                "Task deleted"
            ),
            (None, None) => {}
        }
        Ok(())
    }
}

/// Closed `event_type → handler` table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The table for the four task events
    pub fn task_routes() -> Self {
        [
            TaskEventLogger::created(),
            TaskEventLogger::updated(),
            TaskEventLogger::status_updated(),
            TaskEventLogger::deleted(),
        ]
        .into_iter()
        .fold(Self::new(), |registry, handler| {
            registry.with_handler(handler.event_type(), Arc::new(handler))
        })
    }

    /// Route `event_type` to `handler`, replacing any previous route
    pub fn with_handler(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.routes.insert(event_type.into(), handler);
        self
    }

    /// Handler for `event_type`, if routed
    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.routes.get(event_type)
    }

    /// Every routed event type, sorted
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
