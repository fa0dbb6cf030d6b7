//! # Message Consumers
//!
//! Handler trait, the pull-to-push consumer runner and the lifecycle handle
//! returned by every consumer start

use crate::config::RunnerSettings;
use crate::{Broker, BrokerError, BrokerResult, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked once per delivered message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Run `handler` on `message` in its own task so a panic is contained
/// like any other handler failure
pub(crate) async fn dispatch(handler: &Arc<dyn MessageHandler>, message: Message) -> anyhow::Result<()> {
    let handler = Arc::clone(handler);
    match tokio::spawn(async move { handler.handle(message).await }).await {
        Ok(result) => result,
        Err(join_error) => Err(anyhow::anyhow!("handler panicked: {}", join_error)),
    }
}

/// Delivery counters shared between a consumer task and its handle
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    transport_errors: AtomicU64,
}

impl DeliveryCounters {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a consumer's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Messages the handler accepted
    pub delivered: u64,

    /// Messages whose handler returned an error or panicked
    pub handler_failures: u64,

    /// Failed receive attempts
    pub transport_errors: u64,
}

/// Receiving side of a consumer's shutdown request
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. A dropped handle never requests
    /// shutdown, so the consumer keeps running detached.
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Handle to a running consumer.
///
/// Dropping the handle detaches the consumer; it then runs until the process
/// exits.
#[derive(Debug)]
pub struct ConsumerHandle {
    topic: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    counters: Arc<DeliveryCounters>,
}

impl ConsumerHandle {
    /// Spawn the delivery task built by `make_task`
    pub(crate) fn spawn<F, Fut>(topic: &str, counters: Arc<DeliveryCounters>, make_task: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, rx) = watch::channel(false);
        let task = tokio::spawn(make_task(ShutdownSignal { rx }));

        Self {
            topic: topic.to_string(),
            shutdown_tx,
            task,
            counters,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> DeliveryStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the consumer to stop after the message it is currently handling
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the consumer task to end
    pub async fn join(self) -> BrokerResult<()> {
        self.task
            .await
            .map_err(|e| BrokerError::TaskFailed(e.to_string()))
    }

    /// Request shutdown and wait for the task to end
    pub async fn stop(self) -> BrokerResult<()> {
        self.shutdown();
        self.join().await
    }

    /// Like [`stop`](Self::stop), returning the stats once the message in
    /// flight has been handled
    pub async fn finish(self) -> BrokerResult<DeliveryStats> {
        let counters = Arc::clone(&self.counters);
        self.stop().await?;
        Ok(counters.snapshot())
    }
}

/// Bridges a pull adapter into handler delivery on one background task
pub struct ConsumerRunner {
    adapter: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    settings: RunnerSettings,
}

impl ConsumerRunner {
    /// Fails for adapters that cannot be polled
    pub fn new(
        adapter: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
        settings: RunnerSettings,
    ) -> BrokerResult<Self> {
        if !adapter.delivery_mode().supports_pull() {
            return Err(BrokerError::UnsupportedOperation(format!(
                "{} delivers by push and cannot be polled by a consumer runner",
                adapter.name()
            )));
        }

        Ok(Self {
            adapter,
            handler,
            settings,
        })
    }

    /// Start the delivery loop
    pub fn start(self) -> ConsumerHandle {
        let counters = Arc::new(DeliveryCounters::default());
        let topic = self.adapter.topic().to_string();
        let task_counters = Arc::clone(&counters);

        ConsumerHandle::spawn(&topic, counters, move |shutdown| self.run(shutdown, task_counters))
    }

    async fn run(self, mut shutdown: ShutdownSignal, counters: Arc<DeliveryCounters>) {
        let interval = self.settings.poll_interval();
        info!(
            "Starting {} consumer runner on topic {}",
            self.adapter.name(),
            self.adapter.topic()
        );

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let received = tokio::select! {
                _ = shutdown.requested() => break,
                received = self.adapter.consume() => received,
            };

            match received {
                Ok(message) => {
                    let key = message.key.clone();
                    match dispatch(&self.handler, message).await {
                        Ok(()) => {
                            counters.record_delivered();
                            debug!("Delivered message key={:?} from {}", key, self.adapter.topic());
                        }
                        Err(e) => {
                            counters.record_handler_failure();
                            error!(
                                "Handler failed for message key={:?} on {}: {:#}",
                                key,
                                self.adapter.topic(),
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    counters.record_transport_error();
                    warn!("Failed to consume from {}: {}", self.adapter.topic(), e);
                }
            }
        }

        info!("Consumer runner on topic {} stopped", self.adapter.topic());
    }
}
