//! Worker-pool plumbing shared by the pipeline stages.
//!
//! A stage is an implementation of [`MessageHandler`] fronted by `W`
//! independent consumer loops on the same queue. The seams
//! ([`MessagePublisher`], [`ObjectStorage`](crate::storage::ObjectStorage),
//! [`ModelSource`]) exist so stages can be exercised without a broker,
//! store, or catalog behind them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use photoflow_vision::{ModelSelector, VisionError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::error;

use crate::queue::{Consumer, Publisher, QueueConfig, QueueError};

/// One stage's message entry point.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. Ok acks, Err nacks with requeue.
    async fn handle(&self, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// Publishing seam for stages that emit downstream envelopes.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish one JSON payload to the seam's queue.
    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError>;
}

#[async_trait]
impl MessagePublisher for Publisher {
    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        Publisher::publish(self, payload).await
    }
}

/// Where the analyzer gets its model id from.
pub trait ModelSource: Send + Sync {
    /// Currently selected model id.
    fn current_model(&self) -> Result<String, VisionError>;
}

impl ModelSource for ModelSelector {
    fn current_model(&self) -> Result<String, VisionError> {
        ModelSelector::current_model(self)
    }
}

/// Per-stage worker knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Independent consumer loops per stage.
    pub concurrency: usize,
    /// In-worker attempts per message before giving up.
    pub max_retries: u32,
    /// Fixed wait between in-worker attempts.
    pub retry_delay: Duration,
    /// Wall-clock budget for one message, all attempts included.
    pub message_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            message_deadline: Duration::from_secs(120),
        }
    }
}

/// Health view of a running pool, cheap to clone into the checker.
#[derive(Clone)]
pub struct PoolHealth {
    name: &'static str,
    configured: usize,
    running: Arc<AtomicUsize>,
    consumers: Vec<Arc<Consumer>>,
}

impl PoolHealth {
    /// Stage name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Loops configured at startup.
    pub fn configured(&self) -> usize {
        self.configured
    }

    /// Loops currently alive.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether at least one loop holds a live broker channel.
    pub async fn any_connected(&self) -> bool {
        for consumer in &self.consumers {
            if consumer.connected().await {
                return true;
            }
        }
        false
    }
}

/// `W` consumer loops feeding one handler.
pub struct WorkerPool {
    health: PoolHealth,
    join: JoinSet<()>,
}

impl WorkerPool {
    /// Connect `concurrency` consumers and start their loops. Each loop
    /// owns its connection, so one lost channel never stalls the others.
    pub async fn start(
        name: &'static str,
        queue_config: QueueConfig,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, QueueError> {
        let concurrency = concurrency.max(1);
        let running = Arc::new(AtomicUsize::new(0));
        let mut join = JoinSet::new();
        let mut consumers = Vec::with_capacity(concurrency);

        for idx in 0..concurrency {
            let consumer = Arc::new(Consumer::connect(queue_config.clone()).await?);
            consumers.push(consumer.clone());

            let tag = format!("{name}-{idx}");
            let running = running.clone();
            let shutdown = shutdown.clone();
            let handler = handler.clone();
            join.spawn(async move {
                running.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = consumer.run(&tag, shutdown, handler).await {
                    error!(worker = %tag, "consumer loop failed: {err}");
                }
                consumer.close().await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        Ok(Self {
            health: PoolHealth {
                name,
                configured: concurrency,
                running,
                consumers,
            },
            join,
        })
    }

    /// Health view for this pool.
    pub fn health(&self) -> PoolHealth {
        self.health.clone()
    }

    /// Wait for every loop to drain after shutdown was signalled.
    pub async fn join(mut self) {
        while self.join.join_next().await.is_some() {}
    }
}
