//! # Kafka Backend
//!
//! Pull-mode adapter over `rdkafka`. Each adapter owns its own producer and,
//! when built for consumption, its own consumer subscribed to the topic.

use crate::config::{FlushPolicy, KafkaSettings};
use crate::{Broker, BrokerError, BrokerResult, DeliveryMode, Message};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use tracing::{debug, info};

/// Kafka adapter bound to one topic
pub struct KafkaAdapter {
    topic: String,
    settings: KafkaSettings,
    producer: FutureProducer,
    consumer: Option<StreamConsumer>,
}

impl KafkaAdapter {
    /// Producer and consumer bound to `topic`.
    ///
    /// The consumer joins `settings.group_id`, starts from the earliest
    /// retained offset when the group has none, and auto-commits offsets.
    pub fn new(topic: &str, settings: KafkaSettings) -> BrokerResult<Self> {
        let producer = Self::client_config(&settings).create()?;

        let consumer: StreamConsumer = Self::client_config(&settings)
            .set("group.id", &settings.group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .create()?;
        consumer.subscribe(&[topic])?;

        info!(
            "Kafka adapter for topic {} (group {}) on {}",
            topic,
            settings.group_id,
            settings.bootstrap_servers.join(",")
        );

        Ok(Self {
            topic: topic.to_string(),
            settings,
            producer,
            consumer: Some(consumer),
        })
    }

    /// Producer only; [`Broker::consume`] fails on this adapter.
    ///
    /// Publishing adapters stay out of the consumer group so they never take
    /// partitions away from real consumers.
    pub fn producer_only(topic: &str, settings: KafkaSettings) -> BrokerResult<Self> {
        let producer = Self::client_config(&settings).create()?;
        debug!("Kafka producer for topic {}", topic);

        Ok(Self {
            topic: topic.to_string(),
            settings,
            producer,
            consumer: None,
        })
    }

    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.is_some()
    }

    fn client_config(settings: &KafkaSettings) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", settings.bootstrap_servers.join(","));
        for (key, value) in &settings.properties {
            config.set(key, value);
        }
        config
    }

    async fn flush(&self) -> BrokerResult<()> {
        let producer = self.producer.clone();
        let timeout = self.settings.flush_timeout();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::TaskFailed(e.to_string()))??;
        Ok(())
    }
}

/// Decode a record key; an absent or empty key means "no key"
pub(crate) fn decode_key(raw: Option<&[u8]>) -> BrokerResult<Option<String>> {
    match raw {
        Some(bytes) if !bytes.is_empty() => String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| BrokerError::DecodeError(format!("message key is not UTF-8: {}", e))),
        _ => Ok(None),
    }
}

#[async_trait]
impl Broker for KafkaAdapter {
    async fn produce(&self, value: &[u8], key: Option<&str>) -> BrokerResult<()> {
        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&self.topic).payload(value);
        if let Some(key) = key {
            record = record.key(key);
        }

        // Delivery reports are not awaited; flushing only guarantees the
        // record left the local queue.
        let _delivery = self.producer.send_result(record).map_err(|(e, _)| e)?;

        if self.settings.flush_policy == FlushPolicy::EveryMessage {
            self.flush().await?;
        }
        Ok(())
    }

    async fn consume(&self) -> BrokerResult<Message> {
        let consumer = self.consumer.as_ref().ok_or_else(|| {
            BrokerError::UnsupportedOperation(format!(
                "kafka adapter for {} was created without a consumer",
                self.topic
            ))
        })?;

        let record = consumer.recv().await?;
        let key = decode_key(record.key())?;
        let value = record.payload().map(<[u8]>::to_vec).unwrap_or_default();
        Ok(Message::new(key, value))
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Pull
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn name(&self) -> &'static str {
        "kafka"
    }
}
