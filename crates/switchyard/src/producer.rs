//! # Producer
//!
//! Narrow publishing handle over a backend adapter

use crate::{Broker, BrokerResult};
use std::sync::Arc;

/// Publishes to the topic of the adapter it holds
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn Broker>,
}

impl Producer {
    pub fn new(backend: Arc<dyn Broker>) -> Self {
        Self { backend }
    }

    /// Forward `value` and `key` to the adapter unchanged
    pub async fn produce(&self, value: &[u8], key: Option<&str>) -> BrokerResult<()> {
        self.backend.produce(value, key).await
    }

    pub fn topic(&self) -> &str {
        self.backend.topic()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("backend", &self.backend.name())
            .field("topic", &self.backend.topic())
            .finish()
    }
}
