//! Tests against a broker listening on localhost.
//!
//! Run with `cargo test -- --ignored` once a RabbitMQ instance is up.
use crate::helpers::{get_connection_factory, next, pool_settings, queue_name};
use carrot_stew::amqp::configuration::{ConsumerSettings, PublisherSettings};
use carrot_stew::amqp::ConnectionFactory;
use carrot_stew::consumers::Consumer;
use carrot_stew::pool::{ChannelPool, ConnectionPool};
use carrot_stew::publishers::{Letter, Publisher};
use carrot_stew::topology::{QueueDescriptor, Topologer};

async fn pools() -> (ConnectionPool<ConnectionFactory>, ChannelPool<ConnectionFactory>) {
    let connections = ConnectionPool::new(get_connection_factory(), pool_settings())
        .await
        .unwrap();
    let channels = ChannelPool::new(connections.clone(), pool_settings())
        .await
        .unwrap();
    (connections, channels)
}

#[tokio::test]
#[ignore]
async fn a_closed_channel_is_replaced() {
    let (_connections, channels) = pools().await;

    let channel = channels.acquire().await.unwrap();
    assert!(channel.is_healthy());
    channel
        .raw()
        .close(0, "closing for test")
        .await
        .expect("failed to close channel");
    assert!(!channel.is_healthy());
    channels.flag(channel, anyhow::anyhow!("closed by the test"));

    assert!(channels.acquire().await.unwrap().is_healthy());
}

#[tokio::test]
#[ignore]
async fn letters_round_trip_through_a_live_broker() {
    // Arrange
    let (connections, channels) = pools().await;
    let queue = queue_name();
    let topologer = Topologer::new(channels.clone());
    topologer
        .create_queue(&QueueDescriptor::new(queue.as_str()))
        .await
        .unwrap();
    let publisher = Publisher::new(channels.clone(), PublisherSettings::default());
    let consumer = Consumer::new(channels.clone(), ConsumerSettings::for_queue(queue.as_str()));
    consumer.start_consuming().unwrap();

    // Act
    publisher
        .publish(Letter::new("", queue.as_str(), "hello"))
        .await
        .unwrap();
    let message = next(&consumer.messages()).await;

    // Assert
    assert_eq!(message.body(), b"hello");
    message.acknowledge().await.unwrap();

    consumer.stop_consuming(false, true).await;
    topologer.delete_queue(&queue, false, false).await.unwrap();
    channels.shutdown().await;
    connections.shutdown().await;
}
