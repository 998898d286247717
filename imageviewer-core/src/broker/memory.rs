//! In-process broker for the embedded single-node deployment and tests.
//!
//! Implements the full consumption contract: manual ack, prefetch caps,
//! per-message TTL, retry budgets, and dead-letter routing with `x-death`
//! bookkeeping. Durability is bounded to the process lifetime; an external
//! AMQP broker takes its place in distributed deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Delivery, Envelope, MessageBroker, QueueBinding, QueueConsumer, headers};
use crate::error::{PipelineError, Result};

#[derive(Debug)]
struct StoredMessage {
    envelope: Envelope,
    delivery_count: u32,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct QueueState {
    binding: QueueBinding,
    ready: Mutex<VecDeque<StoredMessage>>,
    unacked: Mutex<HashMap<u64, StoredMessage>>,
    /// Woken on new messages and on freed prefetch slots.
    notify: Notify,
}

impl QueueState {
    fn new(binding: QueueBinding) -> Self {
        Self {
            binding,
            ready: Mutex::new(VecDeque::new()),
            unacked: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, message: StoredMessage) {
        self.ready
            .lock()
            .expect("queue lock poisoned")
            .push_back(message);
        // notify_one stores a permit when nobody is parked yet, so a
        // publish racing a consumer's empty check is never lost.
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        self.ready
            .lock()
            .expect("queue lock poisoned")
            .push_front(message);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct BrokerInner {
    queues: DashMap<String, Arc<QueueState>>,
    next_tag: AtomicU64,
    shutdown: CancellationToken,
}

impl BrokerInner {
    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState::new(QueueBinding {
                    queue: name.to_string(),
                    dead_letter_queue: None,
                    message_ttl: None,
                    max_delivery_attempts: u32::MAX,
                }))
            })
            .clone()
    }

    /// Route a message to its queue's dead-letter target, recording the
    /// death headers recovery relies on. Messages from a queue with no
    /// dead-letter binding are dropped.
    fn dead_letter(&self, origin: &QueueState, mut message: StoredMessage, reason: &str) {
        let Some(target) = origin.binding.dead_letter_queue.clone() else {
            warn!(
                queue = %origin.binding.queue,
                reason, "dropping message from queue without dead-letter binding"
            );
            return;
        };

        let origin_name = origin.binding.queue.clone();
        let headers = &mut message.envelope.headers;
        let death_count = headers
            .get(headers::DEATH_COUNT)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        headers.insert(headers::DEATH_QUEUE.to_string(), origin_name.clone());
        headers.insert(headers::DEATH_REASON.to_string(), reason.to_string());
        headers.insert(headers::DEATH_COUNT.to_string(), death_count.to_string());
        headers
            .entry(headers::FIRST_DEATH_QUEUE.to_string())
            .or_insert_with(|| origin_name.clone());
        headers.insert(headers::LAST_DEATH_QUEUE.to_string(), origin_name.clone());

        message.delivery_count = 0;
        message.enqueued_at = Instant::now();

        debug!(queue = %origin_name, dlq = %target, reason, "dead-lettering message");
        self.queue(&target).push_back(message);
    }
}

/// See module docs.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: DashMap::new(),
                next_tag: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Wake every consumer with `None`; unacknowledged messages stay queued
    /// for the next run.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare_queue(&self, binding: QueueBinding) -> Result<()> {
        let name = binding.queue.clone();
        // Redeclaring replaces the binding but keeps queued messages.
        match self.inner.queues.get(&name) {
            Some(existing) => {
                let mut ready = existing.ready.lock().expect("queue lock poisoned");
                let kept = std::mem::take(&mut *ready);
                drop(ready);
                let state = Arc::new(QueueState::new(binding));
                *state.ready.lock().expect("queue lock poisoned") = kept;
                drop(existing);
                self.inner.queues.insert(name, state);
            }
            None => {
                self.inner
                    .queues
                    .insert(name, Arc::new(QueueState::new(binding)));
            }
        }
        Ok(())
    }

    async fn publish(&self, routing_key: &str, envelope: Envelope) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::Broker("broker is shut down".into()));
        }
        self.inner.queue(routing_key).push_back(StoredMessage {
            envelope,
            delivery_count: 0,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn QueueConsumer>> {
        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            queue: self.inner.queue(queue),
            prefetch: prefetch.max(1) as usize,
            outstanding: HashSet::new(),
        }))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        Ok(self
            .inner
            .queues
            .get(queue)
            .map(|state| state.ready.lock().expect("queue lock poisoned").len() as u64)
            .unwrap_or(0))
    }

    async fn in_flight(&self, queue: &str) -> Result<u64> {
        Ok(self
            .inner
            .queues
            .get(queue)
            .map(|state| state.unacked.lock().expect("queue lock poisoned").len() as u64)
            .unwrap_or(0))
    }
}

struct MemoryConsumer {
    inner: Arc<BrokerInner>,
    queue: Arc<QueueState>,
    prefetch: usize,
    outstanding: HashSet<u64>,
}

impl MemoryConsumer {
    fn try_pop(&self) -> Option<StoredMessage> {
        let mut ready = self.queue.ready.lock().expect("queue lock poisoned");
        while let Some(message) = ready.pop_front() {
            if let Some(ttl) = self.queue.binding.message_ttl {
                if message.enqueued_at.elapsed() >= ttl {
                    drop(ready);
                    self.inner.dead_letter(&self.queue, message, "expired");
                    ready = self.queue.ready.lock().expect("queue lock poisoned");
                    continue;
                }
            }
            return Some(message);
        }
        None
    }

    fn take_unacked(&mut self, delivery: &Delivery) -> Result<StoredMessage> {
        if !self.outstanding.remove(&delivery.tag) {
            return Err(PipelineError::Broker(format!(
                "unknown delivery tag {}",
                delivery.tag
            )));
        }
        self.queue
            .unacked
            .lock()
            .expect("queue lock poisoned")
            .remove(&delivery.tag)
            .ok_or_else(|| {
                PipelineError::Broker(format!("delivery tag {} already settled", delivery.tag))
            })
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            if self.inner.shutdown.is_cancelled() {
                return Ok(None);
            }
            if self.outstanding.len() >= self.prefetch {
                tokio::select! {
                    _ = self.queue.notify.notified() => continue,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                    _ = self.inner.shutdown.cancelled() => return Ok(None),
                }
            }
            match self.try_pop() {
                Some(mut message) => {
                    message.delivery_count += 1;
                    let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
                    let delivery = Delivery {
                        tag,
                        queue: self.queue.binding.queue.clone(),
                        envelope: message.envelope.clone(),
                        redelivered: message.delivery_count > 1,
                    };
                    self.queue
                        .unacked
                        .lock()
                        .expect("queue lock poisoned")
                        .insert(tag, message);
                    self.outstanding.insert(tag);
                    return Ok(Some(delivery));
                }
                None => {
                    // The periodic wake bounds the cost of any wakeup lost
                    // to permit stealing between consumers of one queue.
                    tokio::select! {
                        _ = self.queue.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        _ = self.inner.shutdown.cancelled() => return Ok(None),
                    }
                }
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.take_unacked(delivery)?;
        self.queue.notify.notify_one();
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let message = self.take_unacked(delivery)?;
        if !requeue || message.delivery_count >= self.queue.binding.max_delivery_attempts {
            self.inner.dead_letter(&self.queue, message, "rejected");
            self.queue.notify.notify_one();
        } else {
            self.queue.push_front(message);
        }
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        // Return everything unsettled to the queue so a crashed consumer
        // loses nothing beyond its prefetch window.
        let mut unacked = self.queue.unacked.lock().expect("queue lock poisoned");
        let mut returned = 0usize;
        for tag in self.outstanding.drain() {
            if let Some(message) = unacked.remove(&tag) {
                self.queue
                    .ready
                    .lock()
                    .expect("queue lock poisoned")
                    .push_front(message);
                returned += 1;
            }
        }
        drop(unacked);
        if returned > 0 {
            debug!(queue = %self.queue.binding.queue, returned, "requeued unacknowledged deliveries");
            self.queue.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: &str) -> Envelope {
        Envelope {
            body: body.as_bytes().to_vec(),
            headers: Default::default(),
            expiration: None,
        }
    }

    #[tokio::test]
    async fn publish_consume_ack() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(QueueBinding::work_queue("q", Duration::from_secs(60), 3))
            .await
            .unwrap();
        broker.publish("q", envelope("one")).await.unwrap();

        let mut consumer = broker.consume("q", 10).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.body, b"one");
        assert!(!delivery.redelivered);
        consumer.ack(&delivery).await.unwrap();

        assert_eq!(broker.queue_depth("q").await.unwrap(), 0);
        assert_eq!(broker.in_flight("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nack_requeues_then_dead_letters() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(QueueBinding::work_queue("q", Duration::from_secs(60), 2))
            .await
            .unwrap();
        broker.declare_queue(QueueBinding::dead_letter_queue()).await.unwrap();
        broker.publish("q", envelope("poison")).await.unwrap();

        let mut consumer = broker.consume("q", 1).await.unwrap();

        let first = consumer.next().await.unwrap().unwrap();
        consumer.nack(&first, true).await.unwrap();

        let second = consumer.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        // Second rejection exhausts the delivery budget.
        consumer.nack(&second, true).await.unwrap();

        assert_eq!(broker.queue_depth("q").await.unwrap(), 0);
        assert_eq!(
            broker.queue_depth(imageviewer_model::DLQ_QUEUE).await.unwrap(),
            1
        );

        let mut dlq = broker.consume(imageviewer_model::DLQ_QUEUE, 1).await.unwrap();
        let dead = dlq.next().await.unwrap().unwrap();
        assert_eq!(dead.envelope.headers.get(headers::DEATH_QUEUE).unwrap(), "q");
        assert_eq!(dead.envelope.headers.get(headers::DEATH_COUNT).unwrap(), "1");
    }

    #[tokio::test]
    async fn dropped_consumer_returns_unacked_messages() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(QueueBinding::work_queue("q", Duration::from_secs(60), 3))
            .await
            .unwrap();
        broker.publish("q", envelope("kept")).await.unwrap();

        {
            let mut consumer = broker.consume("q", 5).await.unwrap();
            let _delivery = consumer.next().await.unwrap().unwrap();
            // Dropped without settling.
        }

        assert_eq!(broker.queue_depth("q").await.unwrap(), 1);
        let mut consumer = broker.consume("q", 5).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert!(delivery.redelivered);
        assert_eq!(delivery.envelope.body, b"kept");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dead_lettered_on_delivery() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue(QueueBinding::work_queue("q", Duration::from_millis(10), 3))
            .await
            .unwrap();
        broker.publish("q", envelope("stale")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(broker.queue_depth("q").await.unwrap(), 1);
        let mut consumer = broker.consume("q", 1).await.unwrap();
        // Nothing deliverable; the pop dead-letters the expired message.
        tokio::select! {
            _ = consumer.next() => panic!("expired message must not be delivered"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        assert_eq!(
            broker.queue_depth(imageviewer_model::DLQ_QUEUE).await.unwrap(),
            1
        );
    }
}
