//! # Broker Manager
//!
//! Factory that turns a backend selector and topic names into producers and
//! running consumers

use crate::auth::ServiceAccountKey;
use crate::config::{BrokerConfig, PubSubSettings};
use crate::consumer::{ConsumerHandle, ConsumerRunner, MessageHandler};
use crate::pubsub::PubSubAdapter;
use crate::{Broker, BrokerError, BrokerResult, Producer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Kafka,
    PubSub,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Kafka => "kafka",
            BackendKind::PubSub => "pubsub",
        }
    }
}

impl FromStr for BackendKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kafka" => Ok(BackendKind::Kafka),
            "pubsub" => Ok(BackendKind::PubSub),
            other => Err(BrokerError::UnsupportedBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates adapters for one backend.
///
/// Every `create_*` call builds a fresh adapter with its own connections;
/// nothing is pooled between calls.
#[derive(Debug, Clone)]
pub struct BrokerManager {
    kind: BackendKind,
    config: BrokerConfig,
}

impl BrokerManager {
    /// Validate `backend`, then load the configuration named by
    /// `PUBSUB_CONFIG_PATH`. An unknown backend fails before the file is read.
    pub fn new(backend: &str) -> BrokerResult<Self> {
        let kind: BackendKind = backend.parse()?;
        let config = BrokerConfig::from_env()?;
        Ok(Self::with_config(kind, config))
    }

    pub fn with_config(kind: BackendKind, config: BrokerConfig) -> Self {
        Self { kind, config }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Producer publishing to `topic_id`
    pub fn create_producer(&self, topic_id: &str) -> BrokerResult<Producer> {
        let backend: Arc<dyn Broker> = match self.kind {
            BackendKind::Kafka => self.kafka_adapter(topic_id, false)?,
            BackendKind::PubSub => {
                let (key, settings) = self.pubsub_settings(None)?;
                Arc::new(PubSubAdapter::new(topic_id, key.as_ref(), settings)?)
            }
        };

        info!("Created {} producer for topic {}", self.kind, topic_id);
        Ok(Producer::new(backend))
    }

    /// Start delivering `topic_id` messages to `handler`.
    ///
    /// Kafka polls through a [`ConsumerRunner`]. Pub/Sub registers the handler
    /// on `subscription_id`, or on `GOOGLE_PUBSUB_SUB_ID` when none is given.
    /// Await [`ConsumerHandle::join`] to keep the process alive while
    /// messages arrive.
    pub fn create_consumer<H>(
        &self,
        topic_id: &str,
        handler: H,
        subscription_id: Option<&str>,
    ) -> BrokerResult<ConsumerHandle>
    where
        H: MessageHandler + 'static,
    {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let runner = self.config.runner_settings();

        let handle = match self.kind {
            BackendKind::Kafka => {
                let adapter = self.kafka_adapter(topic_id, true)?;
                ConsumerRunner::new(adapter, handler, runner)?.start()
            }
            BackendKind::PubSub => {
                let (key, settings) = self.pubsub_settings(subscription_id)?;
                if settings.subscription.is_none() {
                    return Err(BrokerError::ConfigError(format!(
                        "a subscription is required to consume {} from Pub/Sub",
                        topic_id
                    )));
                }
                let (_adapter, handle) =
                    PubSubAdapter::with_handler(topic_id, key.as_ref(), settings, handler, runner)?;
                handle
            }
        };

        info!("Created {} consumer for topic {}", self.kind, topic_id);
        Ok(handle)
    }

    fn pubsub_settings(
        &self,
        subscription_id: Option<&str>,
    ) -> BrokerResult<(Option<ServiceAccountKey>, PubSubSettings)> {
        let key = self.config.service_account();
        let settings = PubSubSettings::resolve(&self.config, key.as_ref().ok(), subscription_id)?;

        if settings.emulator {
            return Ok((key.ok(), settings));
        }
        Ok((Some(key?), settings))
    }

    #[cfg(feature = "kafka")]
    fn kafka_adapter(&self, topic_id: &str, consume: bool) -> BrokerResult<Arc<dyn Broker>> {
        use crate::kafka::KafkaAdapter;

        let settings = self.config.kafka_settings()?;
        let adapter = if consume {
            KafkaAdapter::new(topic_id, settings)?
        } else {
            KafkaAdapter::producer_only(topic_id, settings)?
        };
        Ok(Arc::new(adapter))
    }

    #[cfg(not(feature = "kafka"))]
    fn kafka_adapter(&self, _topic_id: &str, _consume: bool) -> BrokerResult<Arc<dyn Broker>> {
        Err(BrokerError::ConfigError(
            "this build does not include the `kafka` feature".to_string(),
        ))
    }
}
