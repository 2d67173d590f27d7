// Copyright 2025 Cowboy AI, LLC.

//! Topic catalogue and aggregate-type routing
//!
//! Both the relay (producer side) and the task consumer reference the names
//! declared here, so topic names cannot drift between the two sides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::events::TASK_AGGREGATE_TYPE;

/// Topic carrying every task event
pub const TASK_EVENTS: &str = "task-events";

/// Provisioning parameters for one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic name
    pub name: String,
    /// Number of ordered partitions
    pub partitions: u32,
    /// Copies kept by the broker
    pub replication_factor: u32,
}

impl TopicConfig {
    /// Describe a topic
    pub fn new(name: impl Into<String>, partitions: u32, replication_factor: u32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// Every topic this service owns, created on startup when missing
pub fn managed_topics() -> Vec<TopicConfig> {
    vec![TopicConfig::new(TASK_EVENTS, 3, 1)]
}

/// Closed `aggregate_type → topic` mapping used by the relay
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    routes: HashMap<String, String>,
}

impl TopicRegistry {
    /// An empty registry; every lookup misses
    pub fn new() -> Self {
        Self::default()
    }

    /// The production mapping: `Task → task-events`
    pub fn standard() -> Self {
        Self::new().with_route(TASK_AGGREGATE_TYPE, TASK_EVENTS)
    }

    /// Register a destination topic for an aggregate type
    pub fn with_route(mut self, aggregate_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.routes.insert(aggregate_type.into(), topic.into());
        self
    }

    /// Destination topic for an aggregate type, if one is registered
    pub fn topic_for(&self, aggregate_type: &str) -> Option<&str> {
        self.routes.get(aggregate_type).map(String::as_str)
    }

    /// All registered destination topics, deduplicated
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.values().cloned().collect();
        topics.sort();
        topics.dedup();
        topics
    }
}

/// Kafka-compatible murmur2 hash of a partition key
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h = SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Partition for a key; equal keys always land on the same partition
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    (murmur2(key.as_bytes()) & 0x7fff_ffff) % partitions
}
