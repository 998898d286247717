//! Typed publish/consume over a message broker.
//!
//! The pipeline consumes a narrow contract: durable publish by routing key,
//! manual acknowledgement with a prefetch cap, and dead-letter routing for
//! messages that exceed their retry budget or TTL. Queue name equals routing
//! key throughout. The in-process implementation in [`memory`] backs the
//! embedded single-node deployment and the test suites.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

use imageviewer_model::MessageType;

use crate::error::Result;

/// Well-known header names.
pub mod headers {
    /// Names the envelope type; the consumer registry and DLQ recovery both
    /// resolve handlers through it.
    pub const MESSAGE_TYPE: &str = "MessageType";
    /// Queue the message was dead-lettered from, most recent first.
    pub const DEATH_QUEUE: &str = "x-death-queue";
    pub const DEATH_REASON: &str = "x-death-reason";
    pub const DEATH_COUNT: &str = "x-death-count";
    pub const FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
    pub const LAST_DEATH_QUEUE: &str = "x-last-death-queue";
    pub const RECOVERED_FROM_DLQ: &str = "x-recovered-from-dlq";
    pub const RECOVERED_AT: &str = "x-recovered-at";

    /// Prefix shared by every header that must be stripped before a
    /// dead-lettered message is republished to its origin queue.
    pub const DEATH_PREFIXES: &[&str] = &["x-death", "x-first-death", "x-last-death"];
}

#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Per-message TTL; expired messages are dead-lettered instead of
    /// delivered.
    pub expiration: Option<Duration>,
}

impl Envelope {
    /// JSON-encode a payload and stamp its `MessageType` header.
    pub fn json<T: Serialize>(message_type: MessageType, payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        let mut headers = BTreeMap::new();
        headers.insert(
            headers::MESSAGE_TYPE.to_string(),
            message_type.header_value().to_string(),
        );
        Ok(Self {
            body,
            headers,
            expiration: None,
        })
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.headers
            .get(headers::MESSAGE_TYPE)
            .and_then(|value| MessageType::from_header_value(value).ok())
    }
}

/// A message handed to a consumer; ack or nack it through the consumer that
/// produced it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub envelope: Envelope,
    pub redelivered: bool,
}

/// Declaration of one queue and its dead-letter binding.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub queue: String,
    pub dead_letter_queue: Option<String>,
    /// Messages older than this are dead-lettered on delivery.
    pub message_ttl: Option<Duration>,
    /// Deliveries before a rejected message is dead-lettered instead of
    /// requeued.
    pub max_delivery_attempts: u32,
}

impl QueueBinding {
    /// A work queue bound to the shared DLQ.
    pub fn work_queue(queue: impl Into<String>, ttl: Duration, max_delivery_attempts: u32) -> Self {
        Self {
            queue: queue.into(),
            dead_letter_queue: Some(imageviewer_model::DLQ_QUEUE.to_string()),
            message_ttl: Some(ttl),
            max_delivery_attempts,
        }
    }

    /// The DLQ itself: no further dead-lettering, no TTL.
    pub fn dead_letter_queue() -> Self {
        Self {
            queue: imageviewer_model::DLQ_QUEUE.to_string(),
            dead_letter_queue: None,
            message_ttl: None,
            max_delivery_attempts: u32::MAX,
        }
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn declare_queue(&self, binding: QueueBinding) -> Result<()>;

    /// Durable publish to the queue named by the routing key.
    async fn publish(&self, routing_key: &str, envelope: Envelope) -> Result<()>;

    /// Open a manual-ack consumer with at most `prefetch` unacknowledged
    /// deliveries in flight.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn QueueConsumer>>;

    /// Messages ready for delivery.
    async fn queue_depth(&self, queue: &str) -> Result<u64>;

    /// Delivered but not yet acknowledged messages.
    async fn in_flight(&self, queue: &str) -> Result<u64>;
}

#[async_trait]
pub trait QueueConsumer: Send {
    /// The next delivery, or `None` once the broker shuts down.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Reject a delivery. With `requeue` the message returns to the front of
    /// its queue (dead-lettered instead once its delivery budget is spent);
    /// without, it is dead-lettered immediately.
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()>;
}

/// Publish a typed message to its well-known queue.
pub async fn publish_message<T: Serialize + Sync>(
    broker: &dyn MessageBroker,
    message_type: MessageType,
    payload: &T,
) -> Result<()> {
    let envelope = Envelope::json(message_type, payload)?;
    broker.publish(message_type.routing_key(), envelope).await
}
