//! CLI command definitions and handlers

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use switchyard::config::{CONFIG_PATH_ENV, EMULATOR_HOST_ENV, PROJECT_ENV, SUBSCRIPTION_ENV};
use switchyard::{BackendKind, BrokerManager, Message};
use tracing::{info, warn};

/// Main CLI structure
#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Publish to and log from Kafka or Google Pub/Sub topics")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Messaging backend (`kafka` or `pubsub`)
    #[arg(short, long, global = true, default_value = "kafka")]
    pub backend: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Publish one message
    Produce {
        /// Topic to publish to
        #[arg(short, long)]
        topic: String,

        /// Message key
        #[arg(short, long)]
        key: Option<String>,

        /// Message payload
        #[arg(short, long, conflicts_with = "file")]
        value: Option<String>,

        /// Read the payload from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Log every message received on a topic until Ctrl-C
    Consume {
        /// Topic to consume
        #[arg(short, long)]
        topic: String,

        /// Pub/Sub subscription (defaults to GOOGLE_PUBSUB_SUB_ID)
        #[arg(short, long)]
        subscription: Option<String>,

        /// Pretty-print payloads as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the backend and the resolved environment
    Info,
}

/// Command execution result
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Execute CLI commands against one backend
pub struct CommandExecutor {
    backend: String,
}

impl CommandExecutor {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_string(),
        }
    }

    /// Execute a CLI command
    pub async fn execute(&self, command: Commands) -> Result<CommandResult> {
        match command {
            Commands::Produce { topic, key, value, file } => {
                let payload = read_payload(value, file)?;
                self.execute_produce(&topic, key.as_deref(), &payload).await
            }
            Commands::Consume { topic, subscription, json } => {
                self.execute_consume(&topic, subscription.as_deref(), json).await
            }
            Commands::Info => self.execute_info(),
        }
    }

    async fn execute_produce(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<CommandResult> {
        let manager = BrokerManager::new(&self.backend)?;
        let producer = manager.create_producer(topic)?;

        producer.produce(payload, key).await?;
        println!("Published {} bytes to {} (key: {})", payload.len(), topic, key.unwrap_or("-"));

        Ok(CommandResult {
            success: true,
            message: "Message published".to_string(),
            data: Some(serde_json::json!({
                "topic": topic,
                "key": key,
                "size": payload.len(),
            })),
        })
    }

    async fn execute_consume(&self, topic: &str, subscription: Option<&str>, json: bool) -> Result<CommandResult> {
        let manager = BrokerManager::new(&self.backend)?;

        let handler = move |msg: Message| async move {
            println!("{}", describe_message(&msg, json)?);
            anyhow::Ok(())
        };
        let handle = manager.create_consumer(topic, handler, subscription)?;

        info!("Consuming {} from {}, press Ctrl+C to stop", topic, manager.kind());
        tokio::signal::ctrl_c().await?;

        let stats = handle.finish().await?;
        if stats.handler_failures > 0 {
            warn!("{} messages could not be logged", stats.handler_failures);
        }

        Ok(CommandResult {
            success: true,
            message: format!("Consumed {} messages", stats.delivered),
            data: Some(serde_json::to_value(stats)?),
        })
    }

    fn execute_info(&self) -> Result<CommandResult> {
        let report = info_report(&self.backend);
        println!("{}", serde_json::to_string_pretty(&report)?);

        Ok(CommandResult {
            success: report["supported"].as_bool().unwrap_or(false),
            message: "Information displayed".to_string(),
            data: Some(report),
        })
    }
}

/// Payload from `--value` or `--file`
pub fn read_payload(value: Option<String>, file: Option<PathBuf>) -> Result<Vec<u8>> {
    match (value, file) {
        (Some(value), None) => Ok(value.into_bytes()),
        (None, Some(path)) => Ok(std::fs::read(path)?),
        _ => Err(anyhow::anyhow!("Exactly one of --value or --file must be specified")),
    }
}

/// One log line per message: key and size, followed by the payload
/// pretty-printed when `json` is set
pub fn describe_message(msg: &Message, json: bool) -> Result<String> {
    let header = format!("key={} size={}", msg.key().unwrap_or("-"), msg.value.len());
    if !json {
        return Ok(header);
    }

    let payload: serde_json::Value = serde_json::from_slice(&msg.value)?;
    Ok(format!("{}\n{}", header, serde_json::to_string_pretty(&payload)?))
}

/// Backend and environment as seen by the manager
pub fn info_report(backend: &str) -> serde_json::Value {
    let mut environment = serde_json::Map::new();
    for name in [CONFIG_PATH_ENV, PROJECT_ENV, SUBSCRIPTION_ENV, EMULATOR_HOST_ENV] {
        let value = std::env::var(name).ok().map_or(serde_json::Value::Null, serde_json::Value::String);
        environment.insert(name.to_string(), value);
    }

    serde_json::json!({
        "name": "switchyard",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": backend,
        "supported": backend.parse::<BackendKind>().is_ok(),
        "environment": environment,
    })
}
