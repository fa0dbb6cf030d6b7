//! Manager construction from the environment

use serde_json::json;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};
use switchyard::config::{CONFIG_PATH_ENV, EMULATOR_HOST_ENV, PROJECT_ENV, SUBSCRIPTION_ENV};
use switchyard::{BackendKind, BrokerConfig, BrokerError, BrokerManager, Message, PubSubSettings};

const SERVICE_ACCOUNT: &str = include_str!("fixtures/service_account.json");

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn lock_env() -> MutexGuard<'static, ()> {
    let guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for var in [CONFIG_PATH_ENV, EMULATOR_HOST_ENV, PROJECT_ENV, SUBSCRIPTION_ENV] {
        std::env::remove_var(var);
    }
    guard
}

fn write_config(document: &serde_json::Value) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(document.to_string().as_bytes()).unwrap();
    file
}

/// Service-account key plus Kafka settings in one document
fn combined_document() -> serde_json::Value {
    let mut document: serde_json::Value = serde_json::from_str(SERVICE_ACCOUNT).unwrap();
    document["kafka_servers"] = json!("127.0.0.1:1, 127.0.0.1:2");
    document["kafka_group_id"] = json!("loggers");
    document["poll_interval_ms"] = json!(5);
    document
}

#[test]
fn test_missing_config_path() {
    let _guard = lock_env();

    let err = BrokerManager::new("kafka").unwrap_err();
    assert!(matches!(err, BrokerError::MissingEnv(name) if name == CONFIG_PATH_ENV));
    assert!(err.is_config_error());
}

#[test]
fn test_unreadable_config_file() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var(CONFIG_PATH_ENV, dir.path().join("missing.json"));

    let err = BrokerManager::new("pubsub").unwrap_err();
    assert!(matches!(err, BrokerError::Io(_)));

    std::env::remove_var(CONFIG_PATH_ENV);
}

#[test]
fn test_malformed_config_file() {
    let _guard = lock_env();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"{ not json").unwrap();
    std::env::set_var(CONFIG_PATH_ENV, file.path());

    let err = BrokerManager::new("kafka").unwrap_err();
    assert!(matches!(err, BrokerError::Json(_)));

    std::env::remove_var(CONFIG_PATH_ENV);
}

#[test]
fn test_unsupported_backend_ignores_config() {
    let _guard = lock_env();

    // No PUBSUB_CONFIG_PATH set: the selector is checked first
    let err = BrokerManager::new("rabbitmq").unwrap_err();
    assert!(matches!(err, BrokerError::UnsupportedBackend(ref name) if name == "rabbitmq"));
    assert!(err.to_string().contains("rabbitmq"));
}

#[test]
fn test_config_is_loaded_once() {
    let _guard = lock_env();
    let file = write_config(&combined_document());
    std::env::set_var(CONFIG_PATH_ENV, file.path());

    let manager = BrokerManager::new("kafka").unwrap();
    std::env::remove_var(CONFIG_PATH_ENV);
    drop(file);

    assert_eq!(manager.kind(), BackendKind::Kafka);
    let settings = manager.config().kafka_settings().unwrap();
    assert_eq!(settings.bootstrap_servers, vec!["127.0.0.1:1", "127.0.0.1:2"]);
    assert_eq!(settings.group_id, "loggers");
    assert_eq!(manager.config().runner_settings().poll_interval_ms, 5);
}

#[test]
fn test_pubsub_without_project() {
    let _guard = lock_env();
    let mut document: serde_json::Value = serde_json::from_str(SERVICE_ACCOUNT).unwrap();
    document
        .as_object_mut()
        .unwrap()
        .remove("project_id");
    let file = write_config(&document);
    std::env::set_var(CONFIG_PATH_ENV, file.path());

    let manager = BrokerManager::new("pubsub").unwrap();
    let err = manager.create_producer("images").unwrap_err();
    assert!(matches!(err, BrokerError::MissingEnv(name) if name == PROJECT_ENV));

    std::env::remove_var(CONFIG_PATH_ENV);
}

#[tokio::test]
async fn test_pubsub_project_falls_back_to_key() {
    let _guard = lock_env();

    let mut server = mockito::Server::new_async().await;
    let publish = server
        .mock("POST", "/v1/projects/switchyard-test/topics/predictions:publish")
        .with_status(200)
        .with_body(r#"{"messageIds": ["7"]}"#)
        .create_async()
        .await;

    let file = write_config(&combined_document());
    std::env::set_var(CONFIG_PATH_ENV, file.path());
    std::env::set_var(EMULATOR_HOST_ENV, server.host_with_port());

    let manager = BrokerManager::new("pubsub").unwrap();
    let producer = manager.create_producer("predictions").unwrap();
    assert_eq!(producer.topic(), "predictions");
    producer.produce(br#"{"prediction": 1}"#, Some("img-0-label-1")).await.unwrap();
    publish.assert_async().await;

    std::env::remove_var(CONFIG_PATH_ENV);
    std::env::remove_var(EMULATOR_HOST_ENV);
}

#[test]
fn test_empty_subscription_env_is_ignored() {
    let _guard = lock_env();
    let file = write_config(&combined_document());
    std::env::set_var(CONFIG_PATH_ENV, file.path());
    std::env::set_var(PROJECT_ENV, "demo");
    std::env::set_var(SUBSCRIPTION_ENV, "");

    let config = BrokerConfig::from_path(file.path()).unwrap();
    let settings = PubSubSettings::resolve(&config, None, None).unwrap();
    assert_eq!(settings.subscription, None);

    let manager = BrokerManager::new("pubsub").unwrap();
    let handler = |_msg: Message| async { anyhow::Ok(()) };
    let err = manager.create_consumer("images", handler, None).unwrap_err();
    assert!(matches!(err, BrokerError::ConfigError(_)));

    for var in [CONFIG_PATH_ENV, PROJECT_ENV, SUBSCRIPTION_ENV] {
        std::env::remove_var(var);
    }
}

#[tokio::test]
async fn test_each_producer_gets_its_own_adapter() {
    let _guard = lock_env();

    let mut server = mockito::Server::new_async().await;
    let publish = server
        .mock("POST", "/v1/projects/demo/topics/images:publish")
        .with_status(200)
        .with_body(r#"{"messageIds": ["1"]}"#)
        .expect(2)
        .create_async()
        .await;

    let file = write_config(&combined_document());
    std::env::set_var(CONFIG_PATH_ENV, file.path());
    std::env::set_var(EMULATOR_HOST_ENV, server.host_with_port());
    std::env::set_var(PROJECT_ENV, "demo");

    let manager = BrokerManager::new("pubsub").unwrap();
    let first = manager.create_producer("images").unwrap();
    let second = manager.create_producer("images").unwrap();

    first.produce(b"from-first", Some("img-0-label-1")).await.unwrap();
    drop(first);
    second.produce(b"from-second", Some("img-1-label-7")).await.unwrap();
    assert_eq!(second.topic(), "images");
    publish.assert_async().await;

    for var in [CONFIG_PATH_ENV, EMULATOR_HOST_ENV, PROJECT_ENV] {
        std::env::remove_var(var);
    }
}

#[cfg(feature = "kafka")]
#[test]
fn test_kafka_requires_servers() {
    let _guard = lock_env();
    let file = write_config(&json!({"kafka_group_id": "loggers"}));
    std::env::set_var(CONFIG_PATH_ENV, file.path());

    let manager = BrokerManager::new("kafka").unwrap();
    let err = manager.create_producer("images").unwrap_err();
    assert!(matches!(err, BrokerError::ConfigError(_)));

    std::env::remove_var(CONFIG_PATH_ENV);
}

#[cfg(feature = "kafka")]
#[tokio::test]
async fn test_kafka_producer_and_consumer_creation() {
    let _guard = lock_env();
    let file = write_config(&combined_document());
    std::env::set_var(CONFIG_PATH_ENV, file.path());

    let manager = BrokerManager::new("kafka").unwrap();
    std::env::remove_var(CONFIG_PATH_ENV);

    let producer = manager.create_producer("images").unwrap();
    assert_eq!(producer.backend_name(), "kafka");
    assert_eq!(producer.topic(), "images");

    // Nothing listens on the configured servers; the runner waits until stopped
    let handler = |_msg: Message| async { anyhow::Ok(()) };
    let handle = manager.create_consumer("images", handler, None).unwrap();
    assert_eq!(handle.topic(), "images");
    assert!(!handle.is_finished());

    handle.stop().await.unwrap();
}
