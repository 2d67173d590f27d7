// Copyright 2025 Cowboy AI, LLC.

//! Event envelope and the task event catalogue
//!
//! The [`EventEnvelope`] is the unit that moves from the outbox table to the
//! broker and on to consumers. It is immutable once built; only the storage
//! status of its outbox record changes afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Aggregate type tag carried by every task event
pub const TASK_AGGREGATE_TYPE: &str = "Task";

/// Event type tags used for topic routing and handler dispatch
pub mod event_types {
    /// A task was created (`before` is absent)
    pub const TASK_CREATED: &str = "task.created";
    /// A task's title or description changed
    pub const TASK_UPDATED: &str = "task.updated";
    /// A task moved to another status
    pub const TASK_STATUS_UPDATED: &str = "task.status.updated";
    /// A task was deleted (`after` is absent)
    pub const TASK_DELETED: &str = "task.deleted";
}

/// Identity of a logical event, stable across publish retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new EventId with UUID v7 (time-ordered)
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Borrow the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Before/after pair of point-in-time aggregate snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// State before the mutation, absent for creations
    #[serde(default)]
    pub before: Option<Value>,
    /// State after the mutation, absent for deletions
    #[serde(default)]
    pub after: Option<Value>,
}

impl EventPayload {
    /// Build a payload from two optional snapshots
    pub fn new(before: Option<Value>, after: Option<Value>) -> Self {
        Self { before, after }
    }
}

/// A domain occurrence as stored in the outbox and carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Unique identity of this event
    pub event_id: EventId,
    /// Routing tag, e.g. `task.created`
    pub event_type: String,
    /// Entity the event concerns; used as the partition key
    pub aggregate_id: String,
    /// Coarse category used to select the destination topic
    pub aggregate_type: String,
    /// When the mutation happened
    pub occurred_at: DateTime<Utc>,
    /// Before/after snapshots
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Create an envelope with a fresh id, stamped now
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Serialize to the JSON message body
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a JSON message body
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Task lifecycle states as they appear in snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Newly created
    Open,
    /// Being worked on
    InProgress,
    /// Finished
    Done,
    /// Soft-deleted
    Deleted,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Open => "OPEN",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
            TaskStatus::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// Observable state of a task at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier
    pub id: String,
    /// Title
    pub title: String,
    /// Free-form description
    pub description: String,
    /// Current status
    pub status: TaskStatus,
}

impl TaskSnapshot {
    fn to_value(&self) -> Value {
        // A struct of strings and a unit enum always serializes.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Task events raised by the application layer
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// `task.created`
    Created {
        /// New state
        after: TaskSnapshot,
    },
    /// `task.updated`
    Updated {
        /// Previous state
        before: TaskSnapshot,
        /// New state
        after: TaskSnapshot,
    },
    /// `task.status.updated`
    StatusUpdated {
        /// Previous state
        before: TaskSnapshot,
        /// New state
        after: TaskSnapshot,
    },
    /// `task.deleted`
    Deleted {
        /// Last state before deletion
        before: TaskSnapshot,
    },
}

impl TaskEvent {
    /// The routing tag for this event
    pub fn event_type(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => event_types::TASK_CREATED,
            TaskEvent::Updated { .. } => event_types::TASK_UPDATED,
            TaskEvent::StatusUpdated { .. } => event_types::TASK_STATUS_UPDATED,
            TaskEvent::Deleted { .. } => event_types::TASK_DELETED,
        }
    }

    /// The task this event concerns
    pub fn aggregate_id(&self) -> &str {
        match self {
            TaskEvent::Created { after } => &after.id,
            TaskEvent::Updated { after, .. } | TaskEvent::StatusUpdated { after, .. } => &after.id,
            TaskEvent::Deleted { before } => &before.id,
        }
    }

    /// Wrap the event in a fresh envelope
    pub fn into_envelope(self) -> EventEnvelope {
        let event_type = self.event_type();
        let aggregate_id = self.aggregate_id().to_string();
        let payload = match &self {
            TaskEvent::Created { after } => EventPayload::new(None, Some(after.to_value())),
            TaskEvent::Updated { before, after } | TaskEvent::StatusUpdated { before, after } => {
                EventPayload::new(Some(before.to_value()), Some(after.to_value()))
            }
            TaskEvent::Deleted { before } => EventPayload::new(Some(before.to_value()), None),
        };

        EventEnvelope::new(event_type, TASK_AGGREGATE_TYPE, aggregate_id, payload)
    }
}
