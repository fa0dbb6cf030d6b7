//! # Broker Configuration
//!
//! Configuration document, backend settings and the environment variables
//! the manager reads

use crate::auth::ServiceAccountKey;
use crate::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Path of the JSON configuration document
pub const CONFIG_PATH_ENV: &str = "PUBSUB_CONFIG_PATH";

/// Google Cloud project used to build Pub/Sub resource paths
pub const PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";

/// Default Pub/Sub subscription
pub const SUBSCRIPTION_ENV: &str = "GOOGLE_PUBSUB_SUB_ID";

/// Host of a local Pub/Sub emulator; disables authentication when set
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";
pub const DEFAULT_GROUP_ID: &str = "consumers";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_MESSAGES: i32 = 10;

/// Configuration document loaded once by the manager.
///
/// The same JSON file carries the Kafka server list and, for Pub/Sub, the
/// service-account key itself, so the raw document is kept next to the typed
/// optional settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    document: serde_json::Value,
    settings: ConfigSettings,
}

/// Optional settings recognised in the configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSettings {
    /// Kafka bootstrap servers, as a list or a comma-separated string
    #[serde(default)]
    pub kafka_servers: Option<ServerList>,

    /// Kafka consumer group
    #[serde(default)]
    pub kafka_group_id: Option<String>,

    /// When the Kafka producer flushes
    #[serde(default)]
    pub kafka_flush_policy: Option<FlushPolicy>,

    /// Upper bound on a single flush
    #[serde(default)]
    pub kafka_flush_timeout_ms: Option<u64>,

    /// Additional librdkafka properties
    #[serde(default)]
    pub kafka_properties: HashMap<String, String>,

    /// Sleep between two polls of a consumer runner
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Messages requested per Pub/Sub pull
    #[serde(default)]
    pub pubsub_max_messages: Option<i32>,
}

/// Server addresses, accepted either as a list or as one comma-separated string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerList {
    List(Vec<String>),
    Csv(String),
}

impl ServerList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ServerList::List(servers) => servers.clone(),
            ServerList::Csv(servers) => servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl BrokerConfig {
    /// Wrap an already parsed document
    pub fn from_value(document: serde_json::Value) -> BrokerResult<Self> {
        if !document.is_object() {
            return Err(BrokerError::ConfigError(
                "configuration document must be a JSON object".to_string(),
            ));
        }
        let settings: ConfigSettings = serde_json::from_value(document.clone())?;
        Ok(Self { document, settings })
    }

    pub fn from_json_str(json: &str) -> BrokerResult<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Load the document named by `PUBSUB_CONFIG_PATH`
    pub fn from_env() -> BrokerResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).map_err(|_| BrokerError::MissingEnv(CONFIG_PATH_ENV))?;
        tracing::debug!("Loading broker configuration from {}", path);
        Self::from_path(path)
    }

    pub fn document(&self) -> &serde_json::Value {
        &self.document
    }

    pub fn settings(&self) -> &ConfigSettings {
        &self.settings
    }

    /// Kafka settings; fails when the document has no usable server list
    pub fn kafka_settings(&self) -> BrokerResult<KafkaSettings> {
        let servers = self
            .settings
            .kafka_servers
            .as_ref()
            .map(ServerList::to_vec)
            .unwrap_or_default();

        if servers.is_empty() {
            return Err(BrokerError::ConfigError(
                "`kafka_servers` is missing or empty".to_string(),
            ));
        }

        let mut settings = KafkaSettings::new(servers);
        if let Some(group_id) = &self.settings.kafka_group_id {
            settings = settings.with_group_id(group_id);
        }
        if let Some(policy) = self.settings.kafka_flush_policy {
            settings = settings.with_flush_policy(policy);
        }
        if let Some(timeout_ms) = self.settings.kafka_flush_timeout_ms {
            settings.flush_timeout_ms = timeout_ms;
        }
        settings.properties = self.settings.kafka_properties.clone();
        Ok(settings)
    }

    /// Parse the whole document as a service-account key
    pub fn service_account(&self) -> BrokerResult<ServiceAccountKey> {
        serde_json::from_value(self.document.clone()).map_err(|e| {
            BrokerError::ConfigError(format!("invalid service account key: {}", e))
        })
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            poll_interval_ms: self.settings.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// When the Kafka producer flushes its local queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Flush after every produced message
    #[default]
    EveryMessage,

    /// Return once the record is enqueued and let librdkafka batch
    Never,
}

/// Kafka adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSettings {
    /// Bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Consumer group ID
    pub group_id: String,

    /// Producer flush policy
    pub flush_policy: FlushPolicy,

    /// Flush timeout in milliseconds
    pub flush_timeout_ms: u64,

    /// Additional Kafka properties
    pub properties: HashMap<String, String>,
}

impl KafkaSettings {
    pub fn new(bootstrap_servers: Vec<String>) -> Self {
        Self {
            bootstrap_servers,
            group_id: DEFAULT_GROUP_ID.to_string(),
            flush_policy: FlushPolicy::default(),
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            properties: HashMap::new(),
        }
    }

    pub fn with_group_id(mut self, group_id: &str) -> Self {
        self.group_id = group_id.to_string();
        self
    }

    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Pub/Sub adapter settings
#[derive(Debug, Clone)]
pub struct PubSubSettings {
    /// Project used in resource paths
    pub project_id: String,

    /// Subscription used for push delivery
    pub subscription: Option<String>,

    /// REST endpoint, without trailing slash
    pub endpoint: String,

    /// Skip authentication (local emulator)
    pub emulator: bool,

    /// Messages requested per pull
    pub max_messages: i32,

    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

impl PubSubSettings {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            subscription: None,
            endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
            emulator: false,
            max_messages: DEFAULT_MAX_MESSAGES,
            timeout_seconds: 60,
        }
    }

    pub fn with_subscription(mut self, subscription: &str) -> Self {
        self.subscription = Some(subscription.to_string());
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    /// Point at a local emulator (`host:port`) and disable authentication
    pub fn with_emulator_host(mut self, host: &str) -> Self {
        self.endpoint = format!("http://{}", host.trim_end_matches('/'));
        self.emulator = true;
        self
    }

    pub fn with_max_messages(mut self, max_messages: i32) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Resolve settings from the environment and the configuration document.
    ///
    /// The project comes from `GOOGLE_CLOUD_PROJECT`, falling back to the
    /// key's `project_id`. The subscription comes from `subscription` or
    /// `GOOGLE_PUBSUB_SUB_ID`.
    pub fn resolve(
        config: &BrokerConfig,
        key: Option<&ServiceAccountKey>,
        subscription: Option<&str>,
    ) -> BrokerResult<Self> {
        let project_id = std::env::var(PROJECT_ENV)
            .ok()
            .filter(|project| !project.is_empty())
            .or_else(|| key.and_then(|key| key.project_id.clone()))
            .ok_or(BrokerError::MissingEnv(PROJECT_ENV))?;

        let mut settings = Self::new(&project_id);
        if let Some(max_messages) = config.settings.pubsub_max_messages {
            settings = settings.with_max_messages(max_messages);
        }

        let subscription = subscription
            .map(str::to_string)
            .or_else(|| std::env::var(SUBSCRIPTION_ENV).ok())
            .filter(|subscription| !subscription.is_empty());
        if let Some(subscription) = subscription {
            settings = settings.with_subscription(&subscription);
        }

        if let Ok(host) = std::env::var(EMULATOR_HOST_ENV) {
            if !host.is_empty() {
                settings = settings.with_emulator_host(&host);
            }
        }

        Ok(settings)
    }
}

/// Consumer runner settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Sleep before every poll, in milliseconds
    pub poll_interval_ms: u64,
}

impl RunnerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}
