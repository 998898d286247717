//! Startup dead-letter recovery.
//!
//! Drains the DLQ and republishes every message to its origin queue with
//! zero loss: publish first, ack second, and on any failure nack-requeue so
//! the message stays dead-lettered for the next run. Messages whose type
//! cannot be determined are left in place for manual review.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, warn};

use imageviewer_model::{DLQ_QUEUE, MessageType};

use crate::broker::{Delivery, Envelope, MessageBroker, headers};
use crate::error::Result;

/// Two empty checks this far apart confirm the queue is drained.
const EMPTY_CONFIRMATION: Duration = Duration::from_secs(5);
/// A non-empty queue with no progress for this long is stuck; stop and
/// leave the remainder for the next startup.
const STALL_LIMIT: Duration = Duration::from_secs(30);
const RECEIVE_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub republished: u64,
    pub left_behind: u64,
}

pub struct DlqRecovery {
    broker: Arc<dyn MessageBroker>,
}

impl std::fmt::Debug for DlqRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqRecovery").finish_non_exhaustive()
    }
}

impl DlqRecovery {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    pub async fn run(&self) -> Result<RecoveryStats> {
        let mut consumer = self.broker.consume(DLQ_QUEUE, 1).await?;
        let mut stats = RecoveryStats::default();
        let mut last_progress = Instant::now();
        let mut empty_since: Option<Instant> = None;

        info!("starting dead-letter recovery");
        loop {
            let depth = self.broker.queue_depth(DLQ_QUEUE).await?;
            let in_flight = self.broker.in_flight(DLQ_QUEUE).await?;

            if depth == 0 && in_flight == 0 {
                match empty_since {
                    Some(since) if since.elapsed() >= EMPTY_CONFIRMATION => break,
                    Some(_) => {}
                    None => empty_since = Some(Instant::now()),
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            empty_since = None;

            if last_progress.elapsed() >= STALL_LIMIT {
                stats.left_behind = depth;
                warn!(
                    remaining = depth,
                    "dead-letter recovery stalled; leaving remainder for next startup"
                );
                break;
            }

            let delivery = tokio::select! {
                delivery = consumer.next() => delivery?,
                _ = tokio::time::sleep(RECEIVE_POLL) => continue,
            };
            let Some(delivery) = delivery else { break };

            match self.republish(&delivery).await {
                Ok(queue) => {
                    // Publish succeeded; only now is it safe to drop the
                    // dead-lettered copy.
                    consumer.ack(&delivery).await?;
                    stats.republished += 1;
                    last_progress = Instant::now();
                    info!(queue, "recovered dead-lettered message");
                }
                Err(e) => {
                    warn!("cannot recover dead-lettered message: {e}");
                    consumer.nack(&delivery, true).await?;
                    // The message went back to the front of the DLQ; pace
                    // the retries until the stall limit gives up.
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }

        info!(
            republished = stats.republished,
            left_behind = stats.left_behind,
            "dead-letter recovery finished"
        );
        Ok(stats)
    }

    /// Work out the origin queue and republish a cleaned copy there.
    /// Returns the queue it was republished to.
    async fn republish(&self, delivery: &Delivery) -> Result<&'static str> {
        let envelope = &delivery.envelope;

        let from_header = envelope.message_type();
        let from_death = envelope
            .headers
            .get(headers::DEATH_QUEUE)
            .and_then(|queue| MessageType::from_routing_key(queue).ok());
        let message_type = match (from_header, from_death) {
            (Some(header_type), Some(death_type)) if header_type != death_type => {
                // The explicit type header wins over broker bookkeeping.
                warn!(
                    header = header_type.header_value(),
                    death_queue = death_type.routing_key(),
                    "MessageType header disagrees with x-death queue; trusting the header"
                );
                header_type
            }
            (Some(header_type), _) => header_type,
            (None, Some(death_type)) => death_type,
            (None, None) => {
                return Err(crate::error::PipelineError::Broker(
                    "dead-lettered message has neither MessageType nor x-death headers".into(),
                ));
            }
        };

        let mut restored = Envelope {
            body: envelope.body.clone(),
            headers: envelope
                .headers
                .iter()
                .filter(|(name, _)| {
                    !headers::DEATH_PREFIXES
                        .iter()
                        .any(|prefix| name.starts_with(prefix))
                })
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            // The original TTL must not follow the message back out, or it
            // would re-expire straight into the DLQ.
            expiration: None,
        };
        restored.headers.insert(
            headers::RECOVERED_FROM_DLQ.to_string(),
            "true".to_string(),
        );
        restored
            .headers
            .insert(headers::RECOVERED_AT.to_string(), Utc::now().to_rfc3339());

        let queue = message_type.routing_key();
        self.broker.publish(queue, restored).await?;
        Ok(queue)
    }
}
