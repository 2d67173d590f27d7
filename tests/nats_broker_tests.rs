// Copyright 2025 Cowboy AI, LLC.

//! Integration tests for NatsBroker
//!
//! These tests require a running NATS server with JetStream enabled.
//! Run with: `nats-server -js`

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use task_outbox::infrastructure::nats_broker::MESSAGE_KEY_HEADER;
use task_outbox::{
    EventEnvelope, EventPayload, InboundMessage, MessageBroker, MessageHandler, NatsBroker,
    NatsConfig, OutboundMessage, TopicConfig,
};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Helper to check if NATS is available
async fn nats_available() -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(2), async_nats::connect("nats://localhost:4222")).await,
        Ok(Ok(_))
    )
}

fn test_config() -> NatsConfig {
    NatsConfig {
        connect_attempts: 1,
        commit_interval_ms: 100,
        ..Default::default()
    }
}

fn unique_topic(test_name: &str) -> TopicConfig {
    TopicConfig::new(format!("test-{test_name}-{}", Uuid::new_v4().simple()), 3, 1)
}

async fn delete_topic(name: &str) {
    if let Ok(client) = async_nats::connect("nats://localhost:4222").await {
        let _ = async_nats::jetstream::new(client).delete_stream(name).await;
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<InboundMessage>>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, _topic: &str, message: &InboundMessage) {
        self.seen.lock().await.push(message.clone());
    }
}

impl Recorder {
    async fn wait_for(&self, count: usize) -> Vec<InboundMessage> {
        for _ in 0..100 {
            let seen = self.seen.lock().await.clone();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.seen.lock().await.clone()
    }
}

#[tokio::test]
async fn test_ensure_topics_creates_missing_only() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let topic = unique_topic("ensure");
    let broker = NatsBroker::connect(test_config(), &[]).await.unwrap();

    let created = broker.ensure_topics(std::slice::from_ref(&topic)).await.unwrap();
    assert_eq!(created, vec![topic.name.clone()]);

    let again = broker.ensure_topics(std::slice::from_ref(&topic)).await.unwrap();
    assert!(again.is_empty());

    broker.shutdown().await.unwrap();
    delete_topic(&topic.name).await;
}

#[tokio::test]
async fn test_publish_and_consume_in_key_order() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let topic = unique_topic("order");
    let broker = NatsBroker::connect(test_config(), std::slice::from_ref(&topic))
        .await
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    broker
        .subscribe(std::slice::from_ref(&topic.name), recorder.clone())
        .await
        .unwrap();

    let events: Vec<EventEnvelope> = ["task.created", "task.updated", "task.status.updated"]
        .into_iter()
        .map(|event_type| EventEnvelope::new(event_type, "Task", "task-1", EventPayload::default()))
        .collect();
    for event in &events {
        broker
            .produce(OutboundMessage::for_event(&topic.name, event).unwrap())
            .await
            .unwrap();
    }

    let seen = recorder.wait_for(3).await;
    let received: Vec<EventEnvelope> = seen
        .iter()
        .map(|m| EventEnvelope::from_json_bytes(&m.value).unwrap())
        .collect();
    assert_eq!(received, events);
    assert!(seen.iter().all(|m| m.key.as_deref() == Some("task-1")));
    assert!(seen.iter().all(|m| m.header("event-type").is_some()));
    assert!(seen.iter().all(|m| !m.headers.contains_key(MESSAGE_KEY_HEADER)));

    broker.shutdown().await.unwrap();
    delete_topic(&topic.name).await;
}

#[tokio::test]
async fn test_resent_event_is_stored_once() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let topic = unique_topic("dedup");
    let broker = NatsBroker::connect(test_config(), std::slice::from_ref(&topic))
        .await
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    broker
        .subscribe(std::slice::from_ref(&topic.name), recorder.clone())
        .await
        .unwrap();

    let event = EventEnvelope::new("task.created", "Task", "task-1", EventPayload::default());
    for _ in 0..2 {
        broker
            .produce(OutboundMessage::for_event(&topic.name, &event).unwrap())
            .await
            .unwrap();
    }

    recorder.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.seen.lock().await.len(), 1);

    broker.shutdown().await.unwrap();
    delete_topic(&topic.name).await;
}

#[tokio::test]
async fn test_produce_to_unknown_topic_fails() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let broker = NatsBroker::connect(test_config(), &[]).await.unwrap();
    let message = OutboundMessage::for_event(
        "no-such-topic",
        &EventEnvelope::new("task.created", "Task", "task-1", EventPayload::default()),
    )
    .unwrap();

    assert!(broker.produce(message).await.is_err());
    broker.shutdown().await.unwrap();
}
