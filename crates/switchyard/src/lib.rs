//! # Switchyard
//!
//! Pluggable publish/subscribe facade. Kafka and Google Cloud Pub/Sub sit
//! behind the same [`Broker`] contract; a [`BrokerManager`] builds producers
//! and starts consumers for whichever backend is selected.
//!
//! Kafka delivers by pull: a [`ConsumerRunner`] polls the adapter and calls
//! the handler. Pub/Sub delivers by push: the handler is registered on the
//! subscription when the adapter is built. Both return a [`ConsumerHandle`]
//! for shutdown and statistics.

pub mod auth;
pub mod broker;
pub mod config;
pub mod consumer;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod manager;
pub mod memory;
pub mod producer;
pub mod pubsub;

pub use broker::*;
pub use config::{BrokerConfig, FlushPolicy, KafkaSettings, PubSubSettings, RunnerSettings};
pub use consumer::{ConsumerHandle, ConsumerRunner, DeliveryStats, MessageHandler};
#[cfg(feature = "kafka")]
pub use kafka::KafkaAdapter;
pub use manager::{BackendKind, BrokerManager};
pub use memory::{MemoryAdapter, MemoryHub};
pub use producer::Producer;
pub use pubsub::PubSubAdapter;
