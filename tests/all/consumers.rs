use crate::helpers::{declare_queues, eventually, in_memory_pools, next, pool_settings, queue_name};
use carrot_stew::amqp::configuration::{ConsumerSettings, PublisherSettings};
use carrot_stew::amqp::types::AMQPValue;
use carrot_stew::consumers::{Consumer, ConsumerState, MessageError};
use carrot_stew::publishers::{Envelope, Letter, Publisher};
use std::collections::HashSet;
use std::time::Duration;

async fn publish(publisher: &Publisher<carrot_stew::amqp::InMemoryBroker>, queue: &str, count: usize) {
    for i in 0..count {
        publisher
            .publish(Letter::new("", queue, format!("message-{i}")))
            .await
            .unwrap();
    }
}

fn settings(queue: &str) -> ConsumerSettings {
    ConsumerSettings {
        drain_timeout_ms: 5_000,
        sleep_on_error_ms: 20,
        ..ConsumerSettings::for_queue(queue)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn messages_from_every_subscription_are_surfaced() {
    // Arrange
    let pools = in_memory_pools(pool_settings()).await;
    let queue = queue_name();
    declare_queues(&pools.channels, &[queue.clone()]).await;
    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());
    publish(&publisher, &queue, 50).await;

    let consumer = Consumer::new(
        pools.channels.clone(),
        ConsumerSettings {
            subscriptions: 3,
            prefetch_count: 5,
            ..settings(&queue)
        },
    );
    let messages = consumer.messages();

    // Act
    consumer.start_consuming().unwrap();
    let mut bodies = HashSet::new();
    let mut channels = HashSet::new();
    for _ in 0..50 {
        let message = next(&messages).await;
        bodies.insert(message.body().to_vec());
        channels.insert(message.channel_id());
        message.acknowledge().await.unwrap();
    }

    // Assert
    assert_eq!(bodies.len(), 50);
    assert!(channels.len() > 1);
    assert_eq!(pools.broker.consumer_count(&queue), 3);
    assert_eq!(pools.broker.message_count(&queue), 0);
    consumer.stop_consuming(false, true).await;
    assert_eq!(pools.broker.consumer_count(&queue), 0);
}

#[tokio::test]
async fn acknowledging_twice_fails_the_second_time() {
    let pools = in_memory_pools(pool_settings()).await;
    let queue = queue_name();
    declare_queues(&pools.channels, &[queue.clone()]).await;
    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());
    publisher
        .publish(Letter::new("", queue.as_str(), "payload").with_envelope(
            Envelope::new("", queue.as_str())
                .with_header("tenant", AMQPValue::LongString("acme".into())),
        ))
        .await
        .unwrap();
    let consumer = Consumer::new(pools.channels.clone(), settings(&queue));
    consumer.start_consuming().unwrap();

    let message = next(&consumer.messages()).await;

    assert_eq!(message.header_str("tenant").as_deref(), Some("acme"));
    assert!(message.acknowledge().await.is_ok());
    assert!(matches!(
        message.acknowledge().await,
        Err(MessageError::AlreadyResolved)
    ));
    consumer.stop_consuming(false, false).await;
}

#[tokio::test]
async fn draining_waits_for_every_outstanding_message() {
    // Arrange
    let pools = in_memory_pools(pool_settings()).await;
    let queue = queue_name();
    declare_queues(&pools.channels, &[queue.clone()]).await;
    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());
    publish(&publisher, &queue, 3).await;
    let consumer = Consumer::new(pools.channels.clone(), settings(&queue));
    consumer.start_consuming().unwrap();
    let messages = consumer.messages();
    let mut outstanding = Vec::new();
    for _ in 0..3 {
        outstanding.push(next(&messages).await);
    }

    // Act
    consumer.stop_consuming(true, true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state_while_draining = consumer.state();
    for message in &outstanding {
        message.acknowledge().await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), consumer.stopped())
        .await
        .unwrap();

    // Assert
    assert_eq!(state_while_draining, ConsumerState::Stopping);
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(pools.broker.message_count(&queue), 0);
    assert_eq!(pools.broker.unacked_count(), 0);
}

#[tokio::test]
async fn stopping_without_draining_fails_outstanding_messages() {
    // Arrange
    let pools = in_memory_pools(pool_settings()).await;
    let queue = queue_name();
    declare_queues(&pools.channels, &[queue.clone()]).await;
    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());
    publish(&publisher, &queue, 3).await;
    let consumer = Consumer::new(pools.channels.clone(), settings(&queue));
    consumer.start_consuming().unwrap();
    let messages = consumer.messages();
    let mut outstanding = Vec::new();
    for _ in 0..3 {
        outstanding.push(next(&messages).await);
    }

    // Act
    consumer.stop_consuming(false, false).await;

    // Assert
    for message in &outstanding {
        assert!(matches!(
            message.reject(true).await,
            Err(MessageError::Orphaned)
        ));
    }
    eventually(|| pools.broker.message_count(&queue) == 3).await;
}

#[tokio::test]
async fn settling_on_a_broken_channel_fails() {
    let pools = in_memory_pools(pool_settings()).await;
    let queue = queue_name();
    declare_queues(&pools.channels, &[queue.clone()]).await;
    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());
    publish(&publisher, &queue, 1).await;
    let consumer = Consumer::new(pools.channels.clone(), settings(&queue));
    consumer.start_consuming().unwrap();
    let message = next(&consumer.messages()).await;

    pools.broker.kill_connections();

    assert!(matches!(
        message.acknowledge().await,
        Err(MessageError::ChannelFlagged)
    ));
    // The broker requeued it and the consumer picks it up on a fresh channel.
    let redelivered = next(&consumer.messages()).await;
    assert!(redelivered.delivery().redelivered);
    assert_ne!(redelivered.channel_id(), message.channel_id());
    redelivered.acknowledge().await.unwrap();
    consumer.stop_consuming(false, true).await;
}
