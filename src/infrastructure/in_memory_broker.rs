// Copyright 2025 Cowboy AI, LLC.

//! In-process broker
//!
//! Keeps a partitioned log per topic and one committed position per
//! (topic, partition) for its consumer group. Used by tests and local runs;
//! it also lets tests inject publish failures and crash a consumer before it
//! commits.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::broker::{BrokerError, InboundMessage, MessageBroker, MessageHandler, OutboundMessage};
use crate::topics::{partition_for_key, TopicConfig};

const DEFAULT_GROUP: &str = "everything-api-group";
const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct BrokerState {
    logs: HashMap<String, Vec<Vec<InboundMessage>>>,
    // Next offset to deliver, per (topic, partition).
    committed: HashMap<(String, u32), u64>,
    message_ids: HashSet<String>,
    fail_next: usize,
    unavailable: bool,
}

impl BrokerState {
    fn unread(&self, topic: &str, cursors: &[u64]) -> Vec<InboundMessage> {
        let Some(partitions) = self.logs.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .zip(cursors)
            .flat_map(|(log, cursor)| log.iter().skip(*cursor as usize).cloned())
            .collect()
    }
}

/// Partitioned log broker living in process memory
///
/// Clones share the log, the committed positions and the consumer tasks.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    group: String,
    commit_interval: Duration,
    state: Arc<Mutex<BrokerState>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    appended: Arc<watch::Sender<u64>>,
    stop: Arc<watch::Sender<bool>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty broker with no topics
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        let (stop, _) = watch::channel(false);
        Self {
            group: DEFAULT_GROUP.to_string(),
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            state: Arc::new(Mutex::new(BrokerState::default())),
            tasks: Arc::new(Mutex::new(Vec::new())),
            appended: Arc::new(appended),
            stop: Arc::new(stop),
        }
    }

    /// Set how often consumers commit their position
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Consumer group name used for committed positions
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Make the next `count` publishes fail
    pub async fn fail_next_publishes(&self, count: usize) {
        self.state.lock().await.fail_next = count;
    }

    /// Reject every publish while `unavailable` is set
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Every message on `topic`, partition by partition
    pub async fn messages(&self, topic: &str) -> Vec<InboundMessage> {
        self.state
            .lock()
            .await
            .logs
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Every message on one partition, in offset order
    pub async fn partition_messages(&self, topic: &str, partition: u32) -> Vec<InboundMessage> {
        self.state
            .lock()
            .await
            .logs
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Committed position of the group on one partition
    pub async fn committed_offset(&self, topic: &str, partition: u32) -> Option<u64> {
        self.state
            .lock()
            .await
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Kill every consumer task without committing
    ///
    /// Messages handled since the last commit are delivered again to the
    /// next subscriber.
    pub async fn simulate_crash(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        warn!(group = %self.group, "Consumers crashed without committing");
    }

    async fn start_positions(&self, topic: &str) -> Result<Vec<u64>, BrokerError> {
        let mut state = self.state.lock().await;
        let ends: Vec<u64> = state
            .logs
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?
            .iter()
            .map(|log| log.len() as u64)
            .collect();

        // A group without a committed position starts at the end and records it.
        Ok(ends
            .into_iter()
            .enumerate()
            .map(|(partition, end)| {
                *state
                    .committed
                    .entry((topic.to_string(), partition as u32))
                    .or_insert(end)
            })
            .collect())
    }
}

async fn commit(state: &Mutex<BrokerState>, topic: &str, cursors: &[u64]) {
    let mut state = state.lock().await;
    for (partition, cursor) in cursors.iter().enumerate() {
        state.committed.insert((topic.to_string(), partition as u32), *cursor);
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn ensure_topics(&self, topics: &[TopicConfig]) -> Result<Vec<String>, BrokerError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(BrokerError::ConnectionFailed("broker unavailable".to_string()));
        }

        let mut created = Vec::new();
        for topic in topics {
            if state.logs.contains_key(&topic.name) {
                continue;
            }
            let partitions = topic.partitions.max(1) as usize;
            state.logs.insert(topic.name.clone(), vec![Vec::new(); partitions]);
            created.push(topic.name.clone());
        }

        if !created.is_empty() {
            info!(topics = %created.join(", "), "Created broker topics");
        }
        Ok(created)
    }

    async fn produce(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(BrokerError::ConnectionFailed("broker unavailable".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BrokerError::PublishFailed(format!(
                "injected failure publishing to {}",
                message.topic
            )));
        }
        if let Some(id) = &message.message_id {
            if state.message_ids.contains(id) {
                debug!(message_id = %id, "Broker dropped duplicate publish");
                return Ok(());
            }
        }

        let partitions = state
            .logs
            .get_mut(&message.topic)
            .ok_or_else(|| BrokerError::TopicNotFound(message.topic.clone()))?;
        let partition = partition_for_key(&message.key, partitions.len() as u32);
        let log = &mut partitions[partition as usize];
        let offset = log.len() as u64;
        log.push(InboundMessage {
            topic: message.topic.clone(),
            partition,
            offset,
            key: Some(message.key),
            value: message.value,
            headers: message.headers,
        });

        if let Some(id) = message.message_id {
            state.message_ids.insert(id);
        }
        drop(state);

        self.appended.send_modify(|count| *count += 1);
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[String],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        for topic in topics {
            let mut cursors = self.start_positions(topic).await?;
            info!(topic = %topic, group = %self.group, "Subscribed to topic");
            let topic = topic.clone();
            let state = self.state.clone();
            let handler = handler.clone();
            let commit_interval = self.commit_interval;
            let mut appended = self.appended.subscribe();
            let mut stop = self.stop.subscribe();

            let task = tokio::spawn(async move {
                // The first commit is one full interval after subscribing.
                let start = tokio::time::Instant::now() + commit_interval;
                let mut ticker = tokio::time::interval_at(start, commit_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    appended.borrow_and_update();
                    let batch = state.lock().await.unread(&topic, &cursors);
                    for message in batch {
                        handler.handle(&topic, &message).await;
                        cursors[message.partition as usize] = message.offset + 1;
                    }

                    tokio::select! {
                        changed = appended.changed() => if changed.is_err() { break },
                        _ = ticker.tick() => commit(&state, &topic, &cursors).await,
                        _ = stop.changed() => break,
                    }
                }

                commit(&state, &topic, &cursors).await;
                debug!(topic = %topic, "Consumer stopped");
            });

            self.tasks.lock().await.push(task);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BrokerError> {
        self.stop.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer task ended abnormally");
            }
        }
        self.stop.send_replace(false);
        info!("Broker producer and consumer disconnected");
        Ok(())
    }
}
