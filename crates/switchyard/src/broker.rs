//! # Broker Abstraction
//!
//! Uniform produce/consume contract implemented by every backend adapter

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A message as seen by producers and handlers.
///
/// The value is opaque; its interpretation is left to the caller. A missing
/// key is `None` on every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: Option<String>,
    pub value: Vec<u8>,
}

impl Message {
    pub fn new(key: Option<String>, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

/// How a backend hands messages to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// The caller polls with [`Broker::consume`]
    Pull,

    /// The transport invokes a handler registered when the adapter is built;
    /// [`Broker::consume`] is not available
    Push,
}

impl DeliveryMode {
    pub fn supports_pull(&self) -> bool {
        matches!(self, DeliveryMode::Pull)
    }
}

/// Backend adapter contract
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `value` on the adapter's topic
    async fn produce(&self, value: &[u8], key: Option<&str>) -> BrokerResult<()>;

    /// Wait for the next message on the adapter's topic.
    ///
    /// Only backends with [`DeliveryMode::Pull`] implement this; push backends
    /// fail with [`BrokerError::UnsupportedOperation`].
    async fn consume(&self) -> BrokerResult<Message>;

    /// Delivery model of this backend
    fn delivery_mode(&self) -> DeliveryMode;

    /// Topic this adapter is bound to
    fn topic(&self) -> &str;

    /// Backend name used in logs
    fn name(&self) -> &'static str;
}

/// Broker operation result type
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broker error
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Backend `{0}` is not supported, only `kafka` and `pubsub` are available")]
    UnsupportedBackend(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("Consumer task failed: {0}")]
    TaskFailed(String),
}

impl BrokerError {
    /// Whether this error was raised while building a manager or adapter from
    /// configuration, before any transport was involved
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BrokerError::UnsupportedBackend(_)
                | BrokerError::ConfigError(_)
                | BrokerError::MissingEnv(_)
                | BrokerError::Io(_)
                | BrokerError::Json(_)
        )
    }
}
