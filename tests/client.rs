// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod helpers;

use helpers::InMemoryBroker;
use rabbitmq_mq::{Envelope, MessageBody, ResponseStatus};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    id: String,
}

impl MessageBody for OrderPlaced {}

fn order(id: &str) -> Envelope<OrderPlaced> {
    Envelope::new(OrderPlaced { id: id.to_owned() })
}

#[tokio::test]
async fn test_nak_without_requeue_moves_the_message_to_the_dlq() {
    let broker = InMemoryBroker::new();
    let mut client = broker.factory().create_message_queue_client();

    let sent = order("A1");
    client.publish_message(&sent).await.unwrap();

    let received = client
        .get_async::<OrderPlaced>("OrderPlaced.inq")
        .await
        .unwrap()
        .unwrap();
    client
        .nak(
            &received,
            false,
            Some(ResponseStatus::new("Rejected", "out of stock")),
        )
        .await
        .unwrap();

    assert_eq!(broker.message_count("OrderPlaced.inq"), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.message_count("OrderPlaced.dlq"), 1);

    let dead = client
        .get_async::<OrderPlaced>("OrderPlaced.dlq")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.id, sent.id);
    assert_eq!(dead.body, sent.body);
    assert_eq!(
        dead.error,
        Some(ResponseStatus::new("Rejected", "out of stock"))
    );

    client.dispose().await;
}

#[tokio::test]
async fn test_nak_with_requeue_redelivers_the_message() {
    let broker = InMemoryBroker::new();
    let mut client = broker.factory().create_message_queue_client();
    client.publish_message(&order("A1")).await.unwrap();

    let first = client
        .get_async::<OrderPlaced>("OrderPlaced.inq")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.retry_attempts, 0);
    client.nak(&first, true, None).await.unwrap();

    let second = client
        .get_async::<OrderPlaced>("OrderPlaced.inq")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.retry_attempts, 1);
    client.ack(&second).await.unwrap();

    assert_eq!(broker.message_count("OrderPlaced.inq"), 0);
    assert_eq!(broker.message_count("OrderPlaced.dlq"), 0);
    client.dispose().await;
}

#[tokio::test]
async fn test_register_queue_twice_is_a_no_op() {
    let broker = InMemoryBroker::new();
    let mut client = broker.factory().create_message_queue_client();

    client.register_queue("OrderPlaced.inq").await.unwrap();
    client.register_queue("OrderPlaced.inq").await.unwrap();

    assert!(broker.queue_exists("OrderPlaced.inq"));
    assert_eq!(broker.queue_count("OrderPlaced."), 1);
    assert_eq!(broker.declare_count("OrderPlaced.inq"), 2);

    client.register_queue("OrderPlaced.dlq").await.unwrap();
    client.register_queue("OrderPlaced.outq").await.unwrap();
    assert_eq!(broker.queue_count("OrderPlaced."), 3);

    client.dispose().await;
}

#[tokio::test]
async fn test_publisher_declares_each_queue_once() {
    let broker = InMemoryBroker::new();
    let mut producer = broker.factory().create_producer();

    for id in ["A1", "A2", "A3"] {
        producer.publish_message(&order(id)).await.unwrap();
    }

    assert_eq!(broker.declare_count("OrderPlaced.inq"), 1);
    assert_eq!(broker.message_count("OrderPlaced.inq"), 3);

    producer.dispose().await;
    producer.dispose().await;
}

#[tokio::test]
async fn test_get_returns_none_after_the_timeout() {
    let broker = InMemoryBroker::new();
    let mut client = broker.factory().create_message_queue_client();
    client.register_queue("OrderPlaced.inq").await.unwrap();

    let started = Instant::now();
    let msg = client
        .get::<OrderPlaced>("OrderPlaced.inq", Some(Duration::from_millis(250)))
        .await
        .unwrap();

    assert!(msg.is_none());
    assert!(started.elapsed() >= Duration::from_millis(250));

    client.dispose().await;
}

#[tokio::test]
async fn test_get_on_an_unknown_queue_registers_it() {
    let broker = InMemoryBroker::new();
    let mut client = broker.factory().create_message_queue_client();

    let msg = client
        .get_async::<OrderPlaced>("OrderShipped.inq")
        .await
        .unwrap();

    assert!(msg.is_none());
    assert!(broker.queue_exists("OrderShipped.inq"));

    client.dispose().await;
}

#[tokio::test]
async fn test_dispose_returns_unacked_messages_to_their_queue() {
    let broker = InMemoryBroker::new();
    let factory = broker.factory();

    let mut producer = factory.create_producer();
    producer.publish_message(&order("A1")).await.unwrap();

    let mut consumer = factory.create_message_queue_client();
    let in_flight = consumer
        .get_async::<OrderPlaced>("OrderPlaced.inq")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broker.message_count("OrderPlaced.inq"), 0);
    consumer.dispose().await;

    assert_eq!(broker.message_count("OrderPlaced.inq"), 1);
    assert_eq!(broker.unacked_count(), 0);

    let mut next = factory.create_message_queue_client();
    let redelivered = next
        .get_async::<OrderPlaced>("OrderPlaced.inq")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.id, in_flight.id);
    assert_eq!(redelivered.retry_attempts, 1);

    producer.dispose().await;
    next.dispose().await;
}

#[tokio::test]
async fn test_factory_filters_and_callbacks_see_every_message() {
    let broker = InMemoryBroker::new();
    let published = Arc::new(AtomicUsize::new(0));
    let fetched = Arc::new(AtomicUsize::new(0));

    let published_counter = published.clone();
    let fetched_counter = fetched.clone();
    let factory = broker
        .factory()
        .publish_filter(|_, props| props.with_app_id("billing".into()))
        .get_filter(move |queue, _| {
            assert_eq!(queue, "OrderPlaced.inq");
            fetched_counter.fetch_add(1, Ordering::SeqCst);
        })
        .on_published(move |queue| {
            assert_eq!(queue, "OrderPlaced.inq");
            published_counter.fetch_add(1, Ordering::SeqCst);
        });

    let mut client = factory.create_message_queue_client();
    client.publish_message(&order("A1")).await.unwrap();

    let peeked = broker.peek("OrderPlaced.inq");
    assert_eq!(
        peeked[0].properties.app_id().as_ref().map(|id| id.as_str()),
        Some("billing")
    );

    let msg = client.get_message("OrderPlaced.inq").await.unwrap();
    assert!(msg.is_some());
    assert_eq!(published.load(Ordering::SeqCst), 1);
    assert_eq!(fetched.load(Ordering::SeqCst), 1);

    client.dispose().await;
}
