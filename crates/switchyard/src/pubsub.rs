//! # Google Cloud Pub/Sub Backend
//!
//! Push-mode adapter over the Pub/Sub REST API. Publishing goes through
//! `topics.publish`; delivery goes through a subscription task that pulls,
//! invokes the handler and acknowledges each message the handler accepted.
//! Polling with [`Broker::consume`] is not supported on this backend.

use crate::auth::{JwtCredentials, ServiceAccountKey, PUBLISHER_AUDIENCE, SUBSCRIBER_AUDIENCE};
use crate::config::{PubSubSettings, RunnerSettings};
use crate::consumer::{dispatch, ConsumerHandle, DeliveryCounters, MessageHandler, ShutdownSignal};
use crate::{Broker, BrokerError, BrokerResult, DeliveryMode, Message};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Attribute carrying the message key
pub const KEY_ATTRIBUTE: &str = "key";

pub fn topic_path(project_id: &str, topic: &str) -> String {
    format!("projects/{}/topics/{}", project_id, topic)
}

pub fn subscription_path(project_id: &str, subscription: &str) -> String {
    format!("projects/{}/subscriptions/{}", project_id, subscription)
}

/// Pub/Sub adapter bound to one topic and, optionally, one subscription
pub struct PubSubAdapter {
    topic: String,
    client: Arc<PubSubClient>,
}

impl PubSubAdapter {
    /// Build the adapter. `key` may only be omitted when the settings point
    /// at an emulator.
    pub fn new(topic: &str, key: Option<&ServiceAccountKey>, settings: PubSubSettings) -> BrokerResult<Self> {
        let credentials = if settings.emulator {
            None
        } else {
            let key = key.ok_or_else(|| {
                BrokerError::ConfigError("a service account key is required for Pub/Sub".to_string())
            })?;
            let subscriber = JwtCredentials::from_service_account(key, SUBSCRIBER_AUDIENCE)?;
            let publisher = subscriber.with_audience(PUBLISHER_AUDIENCE);
            Some(Credentials { publisher, subscriber })
        };

        let client = PubSubClient {
            http: Client::new(),
            topic_path: topic_path(&settings.project_id, topic),
            subscription_path: settings
                .subscription
                .as_deref()
                .map(|subscription| subscription_path(&settings.project_id, subscription)),
            credentials,
            settings,
        };

        Ok(Self {
            topic: topic.to_string(),
            client: Arc::new(client),
        })
    }

    /// Build the adapter and register `handler` on its subscription right away
    pub fn with_handler(
        topic: &str,
        key: Option<&ServiceAccountKey>,
        settings: PubSubSettings,
        handler: Arc<dyn MessageHandler>,
        runner: RunnerSettings,
    ) -> BrokerResult<(Self, ConsumerHandle)> {
        let adapter = Self::new(topic, key, settings)?;
        let handle = adapter.subscribe(handler, runner)?;
        Ok((adapter, handle))
    }

    pub fn topic_path(&self) -> &str {
        &self.client.topic_path
    }

    pub fn subscription_path(&self) -> Option<&str> {
        self.client.subscription_path.as_deref()
    }

    /// Start delivering the subscription's messages to `handler`.
    ///
    /// A message is acknowledged only after its handler returned `Ok`; failed
    /// messages stay unacknowledged and are redelivered by the service.
    pub fn subscribe(&self, handler: Arc<dyn MessageHandler>, runner: RunnerSettings) -> BrokerResult<ConsumerHandle> {
        if self.client.subscription_path.is_none() {
            return Err(BrokerError::ConfigError(format!(
                "no subscription configured for topic {}",
                self.topic
            )));
        }

        let counters = Arc::new(DeliveryCounters::default());
        let task_counters = Arc::clone(&counters);
        let client = Arc::clone(&self.client);
        let idle = runner.poll_interval();

        Ok(ConsumerHandle::spawn(&self.topic, counters, move |shutdown| {
            deliver(client, handler, idle, shutdown, task_counters)
        }))
    }
}

#[async_trait]
impl Broker for PubSubAdapter {
    async fn produce(&self, value: &[u8], key: Option<&str>) -> BrokerResult<()> {
        self.client.publish(value, key).await
    }

    async fn consume(&self) -> BrokerResult<Message> {
        Err(BrokerError::UnsupportedOperation(
            "pubsub delivers through a subscription handler; consume() is not available".to_string(),
        ))
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Push
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn name(&self) -> &'static str {
        "pubsub"
    }
}

async fn deliver(
    client: Arc<PubSubClient>,
    handler: Arc<dyn MessageHandler>,
    idle: Duration,
    mut shutdown: ShutdownSignal,
    counters: Arc<DeliveryCounters>,
) {
    info!(
        "Starting Pub/Sub delivery from {}",
        client.subscription_path.as_deref().unwrap_or_default()
    );

    loop {
        let pulled = tokio::select! {
            _ = shutdown.requested() => break,
            pulled = client.pull() => pulled,
        };

        let received = match pulled {
            Ok(received) => received,
            Err(e) => {
                counters.record_transport_error();
                warn!("Pub/Sub pull failed: {}", e);
                Vec::new()
            }
        };

        if received.is_empty() {
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = tokio::time::sleep(idle) => continue,
            }
        }

        for item in received {
            let message = match item.message.decode() {
                Ok(message) => message,
                Err(e) => {
                    counters.record_transport_error();
                    warn!("Dropping undecodable Pub/Sub message {}: {}", item.ack_id, e);
                    continue;
                }
            };

            let key = message.key.clone();
            match dispatch(&handler, message).await {
                Ok(()) => match client.acknowledge(&item.ack_id).await {
                    Ok(()) => {
                        counters.record_delivered();
                        debug!("Acknowledged message key={:?}", key);
                    }
                    Err(e) => {
                        counters.record_transport_error();
                        warn!("Failed to acknowledge message key={:?}: {}", key, e);
                    }
                },
                Err(e) => {
                    counters.record_handler_failure();
                    error!("Handler failed for message key={:?}, leaving it unacknowledged: {:#}", key, e);
                }
            }

            if shutdown.is_requested() {
                break;
            }
        }
    }

    info!("Pub/Sub delivery for topic {} stopped", client.topic_path);
}

struct Credentials {
    publisher: JwtCredentials,
    subscriber: JwtCredentials,
}

/// REST calls shared by the adapter and its delivery task
struct PubSubClient {
    http: Client,
    topic_path: String,
    subscription_path: Option<String>,
    credentials: Option<Credentials>,
    settings: PubSubSettings,
}

impl PubSubClient {
    async fn publish(&self, value: &[u8], key: Option<&str>) -> BrokerResult<()> {
        let url = format!("{}/v1/{}:publish", self.settings.endpoint, self.topic_path);

        let mut attributes = HashMap::new();
        if let Some(key) = key {
            attributes.insert(KEY_ATTRIBUTE.to_string(), key.to_string());
        }

        let request = PublishRequest {
            messages: vec![OutgoingMessage {
                data: BASE64.encode(value),
                attributes,
                ordering_key: key.map(str::to_string),
            }],
        };

        let token = self.token(|c| &c.publisher)?;
        let response: PublishResponse = self.post(&url, &request, token).await?;
        debug!("Published to {}: {:?}", self.topic_path, response.message_ids);
        Ok(())
    }

    async fn pull(&self) -> BrokerResult<Vec<ReceivedMessage>> {
        let url = format!("{}/v1/{}:pull", self.settings.endpoint, self.require_subscription()?);
        let request = PullRequest {
            max_messages: self.settings.max_messages,
        };

        let token = self.token(|c| &c.subscriber)?;
        let response: PullResponse = self.post(&url, &request, token).await?;
        Ok(response.received_messages)
    }

    async fn acknowledge(&self, ack_id: &str) -> BrokerResult<()> {
        let url = format!("{}/v1/{}:acknowledge", self.settings.endpoint, self.require_subscription()?);
        let request = AcknowledgeRequest {
            ack_ids: vec![ack_id.to_string()],
        };

        let token = self.token(|c| &c.subscriber)?;
        let _: serde_json::Value = self.post(&url, &request, token).await?;
        Ok(())
    }

    fn require_subscription(&self) -> BrokerResult<&str> {
        self.subscription_path
            .as_deref()
            .ok_or_else(|| BrokerError::ConfigError("no subscription configured".to_string()))
    }

    fn token(&self, pick: impl Fn(&Credentials) -> &JwtCredentials) -> BrokerResult<Option<String>> {
        self.credentials.as_ref().map(|c| pick(c).token()).transpose()
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        token: Option<String>,
    ) -> BrokerResult<R> {
        let mut request = self
            .http
            .post(url)
            .json(body)
            .timeout(Duration::from_secs(self.settings.timeout_seconds));

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api { status, message: text });
        }

        Ok(response.json().await?)
    }
}

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<OutgoingMessage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage {
    data: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ordering_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: i32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: IncomingMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

impl IncomingMessage {
    fn decode(mut self) -> BrokerResult<Message> {
        let value = BASE64
            .decode(self.data.as_bytes())
            .map_err(|e| BrokerError::DecodeError(format!("invalid base64 payload: {}", e)))?;
        let key = self.attributes.remove(KEY_ATTRIBUTE).filter(|key| !key.is_empty());
        Ok(Message::new(key, value))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest {
    ack_ids: Vec<String>,
}
