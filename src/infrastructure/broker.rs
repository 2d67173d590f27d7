// Copyright 2025 Cowboy AI, LLC.

//! Broker client contract
//!
//! The relay and dispatcher see the broker as an ordered, partitioned,
//! at-least-once log. Messages sharing a key land on the same partition and
//! keep their publish order.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::events::EventEnvelope;
use crate::topics::TopicConfig;

/// Header carrying the event type tag
pub const EVENT_TYPE_HEADER: &str = "event-type";
/// Header carrying the aggregate type tag
pub const AGGREGATE_TYPE_HEADER: &str = "aggregate-type";

/// Errors that can occur when talking to the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to establish a connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Topic provisioning failed
    #[error("Provisioning error: {0}")]
    ProvisioningError(String),

    /// The broker did not acknowledge a publish
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// The topic does not exist on the broker
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Joining the consumer group or reading messages failed
    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// One message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,
    /// Partition key
    pub key: String,
    /// Message body
    pub value: Bytes,
    /// Headers readable without decoding the body
    pub headers: BTreeMap<String, String>,
    /// Identity the broker uses to drop duplicate physical sends
    pub message_id: Option<String>,
}

impl OutboundMessage {
    /// Build the message for an event: keyed by aggregate id, full envelope
    /// as JSON body, type tags as headers
    pub fn for_event(topic: impl Into<String>, event: &EventEnvelope) -> Result<Self, serde_json::Error> {
        let mut headers = BTreeMap::new();
        headers.insert(EVENT_TYPE_HEADER.to_string(), event.event_type.clone());
        headers.insert(AGGREGATE_TYPE_HEADER.to_string(), event.aggregate_type.clone());

        Ok(Self {
            topic: topic.into(),
            key: event.aggregate_id.clone(),
            value: Bytes::from(event.to_json_bytes()?),
            headers,
            message_id: Some(event.event_id.to_string()),
        })
    }
}

/// One delivered message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Source topic
    pub topic: String,
    /// Partition the message was read from
    pub partition: u32,
    /// Position within the partition (or stream sequence)
    pub offset: u64,
    /// Partition key, when the broker carries it
    pub key: Option<String>,
    /// Message body
    pub value: Bytes,
    /// Message headers
    pub headers: BTreeMap<String, String>,
}

impl InboundMessage {
    /// Look up a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Receives messages from a subscription
///
/// Failures are the handler's to log; nothing is returned to the broker, and
/// progress is committed after the call returns either way.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message
    async fn handle(&self, topic: &str, message: &InboundMessage);
}

/// Producer, consumer and admin operations on the message broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Create every missing topic; returns the names that were created
    async fn ensure_topics(&self, topics: &[TopicConfig]) -> Result<Vec<String>, BrokerError>;

    /// Publish one message and wait for acknowledgement from all replicas
    async fn produce(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Join the consumer group on `topics`, starting from the current end,
    /// and feed every delivered message to `handler`
    async fn subscribe(
        &self,
        topics: &[String],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError>;

    /// Stop consuming and release connections
    async fn shutdown(&self) -> Result<(), BrokerError>;
}

/// Fixed-delay retry policy for the initial connect sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    /// Attempts before giving up (minimum 1)
    pub max_attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            delay: Duration::from_secs(3),
        }
    }
}

/// Run `connect` until it succeeds or the policy is exhausted
///
/// Client libraries retry operations on a live connection but not the first
/// connect, and a broker can take tens of seconds to accept clients after
/// its own start.
pub async fn connect_with_retry<T, F, Fut>(policy: ConnectRetry, mut connect: F) -> Result<T, BrokerError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                error!(
                    attempts = max_attempts,
                    error = %e,
                    "Broker connection failed after {max_attempts} attempts. Is the broker running?"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts,
                    retry_in_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "Broker not ready yet, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, EventEnvelope};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_outbound_message_for_event() {
        let event = EventEnvelope::new("task.created", "Task", "task-1", EventPayload::default());
        let message = OutboundMessage::for_event("task-events", &event).unwrap();

        assert_eq!(message.topic, "task-events");
        assert_eq!(message.key, "task-1");
        assert_eq!(message.headers.get(EVENT_TYPE_HEADER).unwrap(), "task.created");
        assert_eq!(message.headers.get(AGGREGATE_TYPE_HEADER).unwrap(), "Task");
        assert_eq!(message.message_id, Some(event.event_id.to_string()));
        assert_eq!(EventEnvelope::from_json_bytes(&message.value).unwrap(), event);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = ConnectRetry {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        };

        let result = connect_with_retry(policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(BrokerError::ConnectionFailed("refused".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let policy = ConnectRetry {
            max_attempts: 4,
            delay: Duration::from_millis(10),
        };

        let result: Result<(), _> = connect_with_retry(policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::ConnectionFailed("refused".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(BrokerError::ConnectionFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
