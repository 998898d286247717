//! Consumer registry and delivery loop.
//!
//! One explicit table maps every message type to its queue and handler; the
//! same table drives queue declaration and dead-letter recovery, so routing
//! can never drift between the two.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use imageviewer_config::BrokerConfig;
use imageviewer_model::MessageType;

use crate::broker::{Delivery, MessageBroker, QueueBinding};
use crate::error::Result;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn message_type(&self) -> MessageType;

    async fn handle(&self, delivery: &Delivery) -> Result<()>;
}

#[derive(Default)]
pub struct ConsumerRegistry {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    /// Declare every work queue in the fixed table plus the DLQ, whether or
    /// not a handler is registered for it; recovery may republish to any of
    /// them.
    pub async fn declare_queues(
        &self,
        broker: &dyn MessageBroker,
        config: &BrokerConfig,
    ) -> Result<()> {
        let ttl = Duration::from_secs(config.dlq_ttl_seconds);
        for message_type in MessageType::ALL {
            broker
                .declare_queue(QueueBinding::work_queue(
                    message_type.routing_key(),
                    ttl,
                    config.max_delivery_attempts,
                ))
                .await?;
        }
        broker.declare_queue(QueueBinding::dead_letter_queue()).await
    }

    /// Spawn one consumer task per registered handler.
    pub fn spawn_consumers(
        &self,
        broker: Arc<dyn MessageBroker>,
        prefetch: u16,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.handlers
            .iter()
            .map(|handler| {
                let broker = broker.clone();
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_consumer(broker, handler, prefetch, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_consumer(
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn MessageHandler>,
    prefetch: u16,
    shutdown: CancellationToken,
) {
    let queue = handler.message_type().routing_key();
    let mut consumer = match broker.consume(queue, prefetch).await {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(queue, "failed to open consumer: {e}");
            return;
        }
    };
    info!(queue, prefetch, "consumer started");

    loop {
        let delivery = tokio::select! {
            delivery = consumer.next() => delivery,
            _ = shutdown.cancelled() => break,
        };
        let delivery = match delivery {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(e) => {
                error!(queue, "consumer stream failed: {e}");
                break;
            }
        };

        // The handler may be abandoned mid-flight on shutdown; the delivery
        // stays unacknowledged and the broker redelivers it. The settlement
        // below is deliberately not raced against the token: once a handler
        // outcome exists, the ack/nack must happen.
        let outcome = tokio::select! {
            outcome = handler.handle(&delivery) => outcome,
            _ = shutdown.cancelled() => break,
        };

        let settled = match outcome {
            Ok(()) => consumer.ack(&delivery).await,
            Err(e) if e.is_poison() => {
                warn!(queue, "dropping poison message: {e}");
                consumer.ack(&delivery).await
            }
            Err(e) => {
                warn!(queue, "transient handler failure, requeueing: {e}");
                consumer.nack(&delivery, true).await
            }
        };
        if let Err(e) = settled {
            error!(queue, "failed to settle delivery: {e}");
        }
    }
    info!(queue, "consumer stopped");
}
