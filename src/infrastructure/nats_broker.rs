// Copyright 2025 Cowboy AI, LLC.

//! NATS JetStream broker client
//!
//! Topics map onto JetStream streams. A topic with N partitions is a stream
//! bound to the subjects `<topic>.0` … `<topic>.<N-1>`; the partition is
//! chosen from the message key, so one aggregate always publishes to one
//! subject and the stream keeps those messages in publish order.
//!
//! Publishing carries the event id as `Nats-Msg-Id`, which lets the server
//! drop physical resends inside the stream's duplicate window, and waits for
//! the stream's publish acknowledgement. Consumers join a durable pull
//! consumer named after the consumer group. Every handled message is
//! acknowledged on its own at the next commit tick (`AckPolicy::Explicit`),
//! so one member's commit never covers messages another member still holds.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream::{RetentionPolicy, StorageType},
    Context as JetStreamContext,
};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{
    connect_with_retry, BrokerError, ConnectRetry, InboundMessage, MessageBroker, MessageHandler,
    OutboundMessage, AGGREGATE_TYPE_HEADER, EVENT_TYPE_HEADER,
};
use crate::topics::{partition_for_key, TopicConfig};

/// Header carrying the partition key
pub const MESSAGE_KEY_HEADER: &str = "message-key";

const PARTITIONS_METADATA: &str = "partitions";

/// Configuration for the NATS broker connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server URLs (e.g., "nats://localhost:4222")
    pub servers: Vec<String>,

    /// Client name prefix reported to the server
    pub client_name: String,

    /// Durable consumer name shared by every member of the group
    pub consumer_group: String,

    /// Optional username for authentication
    pub user: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Whether TLS is required
    pub tls_required: bool,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Attempts at the initial connect sequence
    pub connect_attempts: u32,

    /// Pause between initial connect attempts in milliseconds
    pub connect_retry_delay_ms: u64,

    /// How often handled messages are acknowledged, in milliseconds
    pub commit_interval_ms: u64,

    /// Redelivery timeout for unacknowledged messages, in seconds
    pub ack_wait_secs: u64,

    /// Window in which the server drops resends with the same message id
    pub duplicate_window_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            client_name: "everything-api".to_string(),
            consumer_group: "everything-api-group".to_string(),
            user: None,
            password: None,
            tls_required: false,
            connection_timeout_secs: 10,
            connect_attempts: 20,
            connect_retry_delay_ms: 3000,
            commit_interval_ms: 5000,
            ack_wait_secs: 30,
            duplicate_window_secs: 120,
        }
    }
}

impl NatsConfig {
    /// Retry policy for the initial connect sequence
    pub fn connect_retry(&self) -> ConnectRetry {
        ConnectRetry {
            max_attempts: self.connect_attempts,
            delay: Duration::from_millis(self.connect_retry_delay_ms),
        }
    }

    fn validate(&self) -> Result<(), BrokerError> {
        if self.servers.is_empty() {
            return Err(BrokerError::ConfigurationError(
                "at least one server URL is required".to_string(),
            ));
        }
        if self.consumer_group.is_empty() {
            return Err(BrokerError::ConfigurationError(
                "consumer group must not be empty".to_string(),
            ));
        }
        // Handled messages must be acknowledged before the server redelivers them.
        if self.commit_interval_ms >= self.ack_wait_secs.saturating_mul(1000) {
            return Err(BrokerError::ConfigurationError(format!(
                "commit interval {}ms must be shorter than ack wait {}s",
                self.commit_interval_ms, self.ack_wait_secs
            )));
        }
        Ok(())
    }
}

async fn connect_client(config: &NatsConfig, role: &str) -> Result<Client, BrokerError> {
    let name = format!("{}-{}", config.client_name, role);
    let mut options = ConnectOptions::new()
        .name(&name)
        .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Disconnected => warn!("NATS disconnected"),
                async_nats::Event::Connected => info!("NATS connected"),
                async_nats::Event::ClientError(err) => error!(error = %err, "NATS client error"),
                _ => {}
            }
        });

    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        options = options.user_and_password(user.clone(), password.clone());
    }

    if config.tls_required {
        options = options.require_tls(true);
    }

    let servers = config.servers.join(",");
    options
        .connect(servers.as_str())
        .await
        .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to connect to {servers}: {e}")))
}

fn stream_config(topic: &TopicConfig, duplicate_window: Duration) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: topic.name.clone(),
        subjects: vec![format!("{}.*", topic.name)],
        num_replicas: topic.replication_factor.max(1) as usize,
        retention: RetentionPolicy::Limits,
        storage: StorageType::File,
        duplicate_window,
        metadata: HashMap::from([(
            PARTITIONS_METADATA.to_string(),
            topic.partitions.max(1).to_string(),
        )]),
        ..Default::default()
    }
}

/// Create missing streams; returns the created names and every topic's partition count
async fn provision(
    js: &JetStreamContext,
    topics: &[TopicConfig],
    duplicate_window: Duration,
) -> Result<(Vec<String>, HashMap<String, u32>), BrokerError> {
    let existing: Vec<String> = js
        .stream_names()
        .try_collect()
        .await
        .map_err(|e| BrokerError::ProvisioningError(format!("Failed to list streams: {e}")))?;

    let mut created = Vec::new();
    let mut partitions = HashMap::new();

    for topic in topics {
        if existing.contains(&topic.name) {
            let count = stored_partitions(js, &topic.name).await?.unwrap_or(topic.partitions);
            partitions.insert(topic.name.clone(), count.max(1));
            continue;
        }

        js.create_stream(stream_config(topic, duplicate_window))
            .await
            .map_err(|e| {
                BrokerError::ProvisioningError(format!("Failed to create stream {}: {e}", topic.name))
            })?;
        partitions.insert(topic.name.clone(), topic.partitions.max(1));
        created.push(topic.name.clone());
    }

    if !created.is_empty() {
        info!(topics = %created.join(", "), "Created broker topics");
    }

    Ok((created, partitions))
}

async fn stored_partitions(js: &JetStreamContext, topic: &str) -> Result<Option<u32>, BrokerError> {
    let stream = js
        .get_stream(topic)
        .await
        .map_err(|_| BrokerError::TopicNotFound(topic.to_string()))?;

    Ok(stream
        .cached_info()
        .config
        .metadata
        .get(PARTITIONS_METADATA)
        .and_then(|value| value.parse().ok()))
}

fn to_inbound(topic: &str, message: &jetstream::Message) -> InboundMessage {
    let subject = message.subject.to_string();
    let partition = subject
        .rsplit('.')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or_default();
    let offset = message.info().map(|info| info.stream_sequence).unwrap_or_default();

    let mut headers = BTreeMap::new();
    let mut key = None;
    if let Some(map) = message.headers.as_ref() {
        for name in [EVENT_TYPE_HEADER, AGGREGATE_TYPE_HEADER] {
            if let Some(value) = map.get(name) {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
        key = map.get(MESSAGE_KEY_HEADER).map(|value| value.as_str().to_string());
    }

    InboundMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key,
        value: message.payload.clone(),
        headers,
    }
}

fn consumer_config(group: &str, ack_wait: Duration) -> pull::Config {
    pull::Config {
        durable_name: Some(group.to_string()),
        deliver_policy: DeliverPolicy::New,
        ack_policy: AckPolicy::Explicit,
        ack_wait,
        ..Default::default()
    }
}

/// Acknowledge every message handled since the last commit
async fn commit(topic: &str, handled: &mut Vec<jetstream::Message>) {
    let count = handled.len();
    for message in handled.drain(..) {
        // Unacknowledged messages are redelivered after ack_wait.
        if let Err(e) = message.ack().await {
            warn!(topic, error = %e, "Failed to acknowledge handled message");
        }
    }
    if count > 0 {
        debug!(topic, count, "Committed handled messages");
    }
}

/// Broker client over NATS JetStream
#[derive(Debug)]
pub struct NatsBroker {
    config: NatsConfig,
    producer_client: Client,
    producer: JetStreamContext,
    consumer: JetStreamContext,
    partitions: RwLock<HashMap<String, u32>>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl NatsBroker {
    /// Run the startup sequence with the configured retry policy
    ///
    /// Connects an admin handle, creates missing topics, releases the admin
    /// handle, then connects the producer and the consumer. Exhausting the
    /// attempts is fatal.
    pub async fn connect(config: NatsConfig, topics: &[TopicConfig]) -> Result<Self, BrokerError> {
        config.validate()?;
        let policy = config.connect_retry();
        connect_with_retry(policy, |_| Self::connect_once(&config, topics)).await
    }

    async fn connect_once(config: &NatsConfig, topics: &[TopicConfig]) -> Result<Self, BrokerError> {
        let duplicate_window = Duration::from_secs(config.duplicate_window_secs);

        let admin = connect_client(config, "admin").await?;
        let (_, partitions) = provision(&jetstream::new(admin.clone()), topics, duplicate_window).await?;
        if let Err(e) = admin.flush().await {
            debug!(error = %e, "Admin flush failed during release");
        }
        drop(admin);

        let producer_client = connect_client(config, "producer").await?;
        info!("Broker producer connected");

        let consumer_client = connect_client(config, "consumer").await?;
        info!("Broker consumer connected");

        let (stop, _) = watch::channel(false);
        Ok(Self {
            config: config.clone(),
            producer: jetstream::new(producer_client.clone()),
            producer_client,
            consumer: jetstream::new(consumer_client),
            partitions: RwLock::new(partitions),
            subscriptions: Mutex::new(Vec::new()),
            stop,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, BrokerError> {
        if let Some(count) = self.partitions.read().await.get(topic) {
            return Ok(*count);
        }

        let count = stored_partitions(&self.producer, topic).await?.unwrap_or(1).max(1);
        self.partitions.write().await.insert(topic.to_string(), count);
        Ok(count)
    }
}

#[async_trait]
impl MessageBroker for NatsBroker {
    async fn ensure_topics(&self, topics: &[TopicConfig]) -> Result<Vec<String>, BrokerError> {
        let window = Duration::from_secs(self.config.duplicate_window_secs);
        let (created, partitions) = provision(&self.producer, topics, window).await?;
        self.partitions.write().await.extend(partitions);
        Ok(created)
    }

    async fn produce(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let partitions = self.partition_count(&message.topic).await?;
        let partition = partition_for_key(&message.key, partitions);
        let subject = format!("{}.{}", message.topic, partition);

        let mut headers = HeaderMap::new();
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }
        headers.insert(MESSAGE_KEY_HEADER, message.key.as_str());
        if let Some(id) = &message.message_id {
            headers.insert(async_nats::header::NATS_MESSAGE_ID, id.as_str());
        }

        let ack = self
            .producer
            .publish_with_headers(subject.clone(), headers, message.value)
            .await
            .map_err(|e| BrokerError::PublishFailed(format!("Failed to publish to {subject}: {e}")))?
            .await
            .map_err(|e| BrokerError::PublishFailed(format!("No acknowledgement from {subject}: {e}")))?;

        if ack.duplicate {
            debug!(subject = %subject, sequence = ack.sequence, "Broker dropped duplicate publish");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let group = self.config.consumer_group.clone();
        let commit_interval = Duration::from_millis(self.config.commit_interval_ms.max(1));

        for topic in topics {
            let stream = self
                .consumer
                .get_stream(topic)
                .await
                .map_err(|_| BrokerError::TopicNotFound(topic.clone()))?;

            let consumer = stream
                .get_or_create_consumer(
                    &group,
                    consumer_config(&group, Duration::from_secs(self.config.ack_wait_secs)),
                )
                .await
                .map_err(|e| BrokerError::SubscriptionError(format!("Failed to join group {group} on {topic}: {e}")))?;

            let mut messages = consumer
                .messages()
                .await
                .map_err(|e| BrokerError::SubscriptionError(format!("Failed to read {topic}: {e}")))?;

            info!(topic = %topic, group = %group, "Subscribed to topic");
            let topic = topic.clone();
            let handler = handler.clone();
            let mut stop = self.stop.subscribe();

            let task = tokio::spawn(async move {
                // The first commit is one full interval after subscribing.
                let start = tokio::time::Instant::now() + commit_interval;
                let mut ticker = tokio::time::interval_at(start, commit_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut handled: Vec<jetstream::Message> = Vec::new();

                loop {
                    tokio::select! {
                        next = messages.next() => match next {
                            Some(Ok(message)) => {
                                let inbound = to_inbound(&topic, &message);
                                handler.handle(&topic, &inbound).await;
                                handled.push(message);
                            }
                            Some(Err(e)) => warn!(topic = %topic, error = %e, "Error reading from consumer"),
                            None => break,
                        },
                        _ = ticker.tick() => commit(&topic, &mut handled).await,
                        _ = stop.changed() => break,
                    }
                }

                commit(&topic, &mut handled).await;
                debug!(topic = %topic, "Consumer stopped");
            });

            self.subscriptions.lock().await.push(task);
        }

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        let _ = self.stop.send(true);

        let tasks: Vec<JoinHandle<()>> = self.subscriptions.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer task ended abnormally");
            }
        }

        if let Err(e) = self.producer_client.flush().await {
            warn!(error = %e, "Producer flush failed during shutdown");
        }
        info!("Broker producer and consumer disconnected");
        Ok(())
    }
}
