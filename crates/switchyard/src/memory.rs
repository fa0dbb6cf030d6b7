//! # In-Process Broker
//!
//! Pull-mode backend that keeps topics in memory. Adapters created from the
//! same [`MemoryHub`] share topics by name; adapters from different hubs
//! never see each other's messages. Every consumer of a topic competes for
//! its messages, like members of one Kafka consumer group.

use crate::{Broker, BrokerResult, DeliveryMode, Message};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Default)]
struct TopicQueue {
    messages: Mutex<VecDeque<Message>>,
    available: Notify,
}

impl TopicQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.messages.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, message: Message) {
        self.lock().push_back(message);
        self.available.notify_one();
    }

    fn try_pop(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    async fn pop(&self) -> Message {
        loop {
            let notified = self.available.notified();
            if let Some(message) = self.try_pop() {
                return message;
            }
            notified.await;
        }
    }
}

/// Registry of in-memory topics
#[derive(Clone, Default)]
pub struct MemoryHub {
    topics: Arc<Mutex<HashMap<String, Arc<TopicQueue>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, topic: &str) -> Arc<TopicQueue> {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(topics.entry(topic.to_string()).or_default())
    }

    /// New adapter bound to `topic`
    pub fn adapter(&self, topic: &str) -> MemoryAdapter {
        MemoryAdapter {
            topic: topic.to_string(),
            queue: self.queue(topic),
        }
    }

    /// Messages waiting on `topic`
    pub fn pending(&self, topic: &str) -> usize {
        self.queue(topic).len()
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<String> = self
            .topics
            .lock()
            .map(|topics| topics.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("MemoryHub").field("topics", &topics).finish()
    }
}

/// Adapter over one in-memory topic
pub struct MemoryAdapter {
    topic: String,
    queue: Arc<TopicQueue>,
}

#[async_trait]
impl Broker for MemoryAdapter {
    async fn produce(&self, value: &[u8], key: Option<&str>) -> BrokerResult<()> {
        // Empty keys read back as no key, like Kafka record keys
        let key = key.filter(|key| !key.is_empty()).map(str::to_string);
        self.queue.push(Message::new(key, value.to_vec()));
        Ok(())
    }

    async fn consume(&self) -> BrokerResult<Message> {
        Ok(self.queue.pop().await)
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Pull
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_produce_then_consume() {
        let hub = MemoryHub::new();
        let adapter = hub.adapter("images");

        adapter.produce(b"\x00\x01tensor", Some("img-0-label-1")).await.unwrap();
        let msg = adapter.consume().await.unwrap();

        assert_eq!(msg.key(), Some("img-0-label-1"));
        assert_eq!(msg.value, b"\x00\x01tensor".to_vec());
        assert_eq!(adapter.delivery_mode(), DeliveryMode::Pull);
    }

    #[tokio::test]
    async fn test_empty_key_reads_back_as_none() {
        let hub = MemoryHub::new();
        let adapter = hub.adapter("images");

        adapter.produce(b"v", Some("")).await.unwrap();
        let msg = adapter.consume().await.unwrap();
        assert_eq!(msg.key, None);
    }

    #[tokio::test]
    async fn test_produce_survives_poisoned_queue() {
        let hub = MemoryHub::new();
        let queue = hub.queue("images");
        let _ = std::thread::spawn(move || {
            let _guard = queue.messages.lock().unwrap();
            panic!("poison the topic queue");
        })
        .join();

        let adapter = hub.adapter("images");
        adapter.produce(b"after-poison", Some("k")).await.unwrap();
        assert_eq!(hub.pending("images"), 1);

        let msg = adapter.consume().await.unwrap();
        assert_eq!(msg.value, b"after-poison".to_vec());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = MemoryHub::new();
        hub.adapter("images").produce(b"a", None).await.unwrap();

        assert_eq!(hub.pending("images"), 1);
        assert_eq!(hub.pending("predictions"), 0);

        let other_hub = MemoryHub::new();
        assert_eq!(other_hub.pending("images"), 0);
    }

    #[tokio::test]
    async fn test_consume_waits_for_message() {
        let hub = MemoryHub::new();
        let consumer = hub.adapter("images");
        let producer = hub.adapter("images");

        let waiter = tokio::spawn(async move { consumer.consume().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        producer.produce(b"late", None).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.value, b"late".to_vec());
        assert_eq!(msg.key, None);
    }
}
