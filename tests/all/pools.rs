use crate::helpers::{eventually, in_memory_pools, next, pool_settings};
use carrot_stew::amqp::configuration::PoolSettings;
use carrot_stew::amqp::InMemoryBroker;
use carrot_stew::events::ResourceKind;
use carrot_stew::pool::{ConnectionPool, Error};
use std::time::{Duration, Instant};

#[tokio::test]
async fn the_minimum_is_created_eagerly() {
    // Arrange
    let settings = PoolSettings {
        min_connections: 2,
        ..pool_settings()
    };

    // Act
    let pools = in_memory_pools(settings).await;

    // Assert
    assert_eq!(pools.broker.open_connections(), 2);
    assert_eq!(pools.connections.status().healthy, 2);
    assert!(pools.channels.status().healthy >= 2);
}

#[tokio::test]
async fn an_unreachable_broker_is_a_construction_error() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);

    let outcome = ConnectionPool::new(broker, pool_settings()).await;

    assert!(outcome.is_err());
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let settings = PoolSettings {
        min_connections: 4,
        max_connections: 2,
        ..pool_settings()
    };

    let outcome = ConnectionPool::new(InMemoryBroker::new(), settings).await;

    assert!(matches!(outcome, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn acquiring_from_an_unreachable_broker_is_bounded() {
    // Arrange
    let settings = PoolSettings {
        min_channels: 0,
        acquire_timeout_ms: 200,
        ..pool_settings()
    };
    let pools = in_memory_pools(settings).await;
    pools.broker.set_reachable(false);
    pools.broker.kill_connections();

    // Act
    let started = Instant::now();
    let outcome = pools.channels.acquire().await;

    // Assert
    assert!(outcome.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn killed_connections_are_replaced_once_the_broker_is_back() {
    // Arrange
    let pools = in_memory_pools(pool_settings()).await;
    let errors = pools.connections.errors();
    pools.broker.set_reachable(false);

    // Act
    pools.broker.kill_connections();
    let first = next(&errors).await;
    // Replacement attempts keep failing while the broker is unreachable.
    let second = next(&errors).await;
    pools.broker.set_reachable(true);

    // Assert
    assert_eq!(first.kind, ResourceKind::Connection);
    assert_eq!(second.kind, ResourceKind::Connection);
    eventually(|| pools.connections.status().healthy >= 1).await;
    eventually(|| pools.channels.status().healthy >= 2).await;
    assert!(pools.channels.acquire().await.unwrap().is_healthy());
    assert!(!pools.connections.is_shut_down());
}

#[tokio::test]
async fn flagged_connections_are_replaced() {
    let pools = in_memory_pools(pool_settings()).await;
    let errors = pools.connections.errors();

    let connection = pools.connections.acquire().await.unwrap();
    let flagged_id = connection.id();
    pools
        .connections
        .flag(connection, anyhow::anyhow!("heartbeat missed"));

    let error = next(&errors).await;
    assert_eq!(error.resource_id, Some(flagged_id));
    eventually(|| pools.connections.status().healthy >= 1).await;
    assert_ne!(pools.connections.acquire().await.unwrap().id(), flagged_id);
}

#[tokio::test]
async fn shutdown_is_terminal_and_idempotent() {
    let pools = in_memory_pools(pool_settings()).await;

    pools.channels.shutdown().await;
    pools.connections.shutdown().await;
    pools.connections.shutdown().await;

    assert!(matches!(pools.channels.acquire().await, Err(Error::Shutdown)));
    assert!(matches!(
        pools.connections.acquire().await,
        Err(Error::Shutdown)
    ));
    assert_eq!(pools.broker.open_connections(), 0);
}
