// Copyright 2025 Cowboy AI, LLC.

//! Delivery tunables
//!
//! Every struct has working defaults; [`OutboxConfig::from_env`] overrides
//! them from the process environment.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::errors::{OutboxError, OutboxResult};
use crate::infrastructure::NatsConfig;

/// Default relay poll period
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
/// Default number of records claimed per cycle
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default failure ceiling before a record is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Outbox relay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Period between polls in milliseconds
    pub poll_interval_ms: u64,

    /// Maximum records claimed per poll
    pub batch_size: usize,

    /// Failures after which a record becomes FAILED
    pub max_retries: u32,

    /// Reclaim PROCESSING records older than this many seconds; `None` disables the sweeper
    pub processing_timeout_secs: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            processing_timeout_secs: None,
        }
    }
}

impl RelayConfig {
    /// Poll period as a duration (at least one millisecond)
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Stale claim timeout, when the sweeper is enabled
    pub fn processing_timeout(&self) -> Option<Duration> {
        self.processing_timeout_secs.map(Duration::from_secs)
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> OutboxResult<()> {
        if self.batch_size == 0 {
            return Err(OutboxError::configuration("batch size must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(OutboxError::configuration("max retries must be at least 1"));
        }
        Ok(())
    }
}

/// Inbound dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Event ids remembered for duplicate suppression
    pub dedup_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

/// Complete configuration for the delivery subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Relay settings
    pub relay: RelayConfig,
    /// Dispatcher settings
    pub dispatcher: DispatcherConfig,
    /// Broker connection settings
    pub nats: NatsConfig,
    /// Outbox database connection string
    pub database_url: Option<String>,
}

impl OutboxConfig {
    /// Build the configuration from process environment variables
    pub fn from_env() -> OutboxResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> OutboxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(brokers) = lookup("BROKER_URLS").or_else(|| lookup("KAFKA_BROKERS")) {
            let servers: Vec<String> = brokers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if servers.is_empty() {
                return Err(OutboxError::configuration("broker list is empty"));
            }
            config.nats.servers = servers;
        }
        if let Some(group) = lookup("CONSUMER_GROUP_ID") {
            config.nats.consumer_group = group;
        }
        if let Some(ms) = parse::<_, u64>(&lookup, "OUTBOX_POLL_INTERVAL_MS")? {
            config.relay.poll_interval_ms = ms;
        }
        if let Some(size) = parse::<_, usize>(&lookup, "OUTBOX_BATCH_SIZE")? {
            config.relay.batch_size = size;
        }
        if let Some(retries) = parse::<_, u32>(&lookup, "OUTBOX_MAX_RETRIES")? {
            config.relay.max_retries = retries;
        }
        if let Some(secs) = parse::<_, u64>(&lookup, "OUTBOX_PROCESSING_TIMEOUT_SECS")? {
            config.relay.processing_timeout_secs = Some(secs);
        }
        if let Some(capacity) = parse::<_, usize>(&lookup, "DEDUP_CACHE_CAPACITY")? {
            config.dispatcher.dedup_capacity = capacity;
        }
        config.database_url = lookup("DATABASE_URL");

        config.relay.validate()?;
        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> OutboxResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| OutboxError::configuration(format!("{key}={raw:?}: {e}"))),
    }
}
