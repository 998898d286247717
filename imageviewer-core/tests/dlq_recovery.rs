//! Dead-letter recovery against the in-memory broker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use imageviewer_core::broker::memory::MemoryBroker;
use imageviewer_core::broker::{Envelope, MessageBroker, QueueBinding, headers};
use imageviewer_core::recovery::DlqRecovery;
use imageviewer_model::{DLQ_QUEUE, MessageType};

async fn declare_all(broker: &MemoryBroker) {
    for message_type in MessageType::ALL {
        broker
            .declare_queue(QueueBinding::work_queue(
                message_type.routing_key(),
                Duration::from_secs(24 * 60 * 60),
                3,
            ))
            .await
            .unwrap();
    }
    broker
        .declare_queue(QueueBinding::dead_letter_queue())
        .await
        .unwrap();
}

fn dead_lettered(message_type: MessageType, body: &str) -> Envelope {
    let mut headers_map = BTreeMap::new();
    headers_map.insert(
        headers::MESSAGE_TYPE.to_string(),
        message_type.header_value().to_string(),
    );
    headers_map.insert(
        headers::DEATH_QUEUE.to_string(),
        message_type.routing_key().to_string(),
    );
    headers_map.insert(headers::DEATH_COUNT.to_string(), "1".to_string());
    headers_map.insert(
        headers::FIRST_DEATH_QUEUE.to_string(),
        message_type.routing_key().to_string(),
    );
    Envelope {
        body: body.as_bytes().to_vec(),
        headers: headers_map,
        expiration: Some(Duration::from_secs(60)),
    }
}

#[tokio::test(start_paused = true)]
async fn recovery_restores_messages_to_their_origin_queues() {
    let broker = MemoryBroker::new();
    declare_all(&broker).await;

    for index in 0..3 {
        broker
            .publish(
                DLQ_QUEUE,
                dead_lettered(MessageType::ThumbnailGeneration, &format!("thumb-{index}")),
            )
            .await
            .unwrap();
    }
    for index in 0..2 {
        broker
            .publish(
                DLQ_QUEUE,
                dead_lettered(MessageType::CacheGeneration, &format!("cache-{index}")),
            )
            .await
            .unwrap();
    }

    let shared: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    let stats = DlqRecovery::new(shared.clone()).run().await.unwrap();
    assert_eq!(stats.republished, 5);
    assert_eq!(stats.left_behind, 0);

    assert_eq!(shared.queue_depth(DLQ_QUEUE).await.unwrap(), 0);
    assert_eq!(
        shared
            .queue_depth(MessageType::ThumbnailGeneration.routing_key())
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        shared
            .queue_depth(MessageType::CacheGeneration.routing_key())
            .await
            .unwrap(),
        2
    );

    // Every recovered message is marked and carries no death bookkeeping or
    // TTL that could bounce it straight back.
    let mut consumer = shared
        .consume(MessageType::ThumbnailGeneration.routing_key(), 10)
        .await
        .unwrap();
    for _ in 0..3 {
        let delivery = consumer.next().await.unwrap().unwrap();
        let envelope = &delivery.envelope;
        assert_eq!(
            envelope.headers.get(headers::RECOVERED_FROM_DLQ),
            Some(&"true".to_string())
        );
        assert!(envelope.headers.contains_key(headers::RECOVERED_AT));
        assert!(envelope.expiration.is_none());
        assert!(
            !envelope
                .headers
                .keys()
                .any(|name| name.starts_with("x-death")
                    || name.starts_with("x-first-death")
                    || name.starts_with("x-last-death")),
            "death headers must be stripped: {:?}",
            envelope.headers
        );
        consumer.ack(&delivery).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn recovery_falls_back_to_death_headers_without_message_type() {
    let broker = MemoryBroker::new();
    declare_all(&broker).await;

    let mut envelope = dead_lettered(MessageType::ImageProcessing, "legacy");
    envelope.headers.remove(headers::MESSAGE_TYPE);
    broker.publish(DLQ_QUEUE, envelope).await.unwrap();

    let shared: Arc<dyn MessageBroker> = Arc::new(broker);
    let stats = DlqRecovery::new(shared.clone()).run().await.unwrap();
    assert_eq!(stats.republished, 1);
    assert_eq!(
        shared
            .queue_depth(MessageType::ImageProcessing.routing_key())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn unidentifiable_messages_stay_in_the_dlq() {
    let broker = MemoryBroker::new();
    declare_all(&broker).await;

    let envelope = Envelope {
        body: b"mystery".to_vec(),
        headers: BTreeMap::new(),
        expiration: None,
    };
    broker.publish(DLQ_QUEUE, envelope).await.unwrap();

    let shared: Arc<dyn MessageBroker> = Arc::new(broker);
    let stats = DlqRecovery::new(shared.clone()).run().await.unwrap();
    assert_eq!(stats.republished, 0);
    // Never lost: still dead-lettered for manual review.
    assert_eq!(shared.queue_depth(DLQ_QUEUE).await.unwrap(), 1);
}
