// Copyright 2025 Cowboy AI, LLC.

//! Error types for outbox delivery

use thiserror::Error;

use crate::handlers::HandlerError;
use crate::infrastructure::{BrokerError, StoreError};

/// Errors surfaced by the delivery components
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Outbox store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker client failure
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Event handler failure
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A background task could not be joined
    #[error("Task join error: {0}")]
    Join(String),
}

/// Result type for delivery operations
pub type OutboxResult<T> = Result<T, OutboxError>;

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        OutboxError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for OutboxError {
    fn from(err: tokio::task::JoinError) -> Self {
        OutboxError::Join(err.to_string())
    }
}

impl OutboxError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        OutboxError::Configuration(msg.into())
    }

    /// Check if this is a configuration error
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            OutboxError::Configuration(_) | OutboxError::Broker(BrokerError::ConfigurationError(_))
        )
    }

    /// Check if retrying later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OutboxError::Store(StoreError::ConnectionError(_))
                | OutboxError::Broker(BrokerError::ConnectionFailed(_))
                | OutboxError::Broker(BrokerError::PublishFailed(_))
        )
    }
}
