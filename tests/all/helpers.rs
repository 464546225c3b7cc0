use carrot_stew::amqp::configuration::{BackoffSettings, PoolSettings, RabbitMqSettings};
use carrot_stew::amqp::{ConnectionFactory, InMemoryBroker};
use carrot_stew::events::EventStream;
use carrot_stew::pool::{ChannelPool, ConnectionPool};
use carrot_stew::topology::{QueueDescriptor, Topologer};
use std::time::Duration;
use uuid::Uuid;

pub fn get_rabbitmq_settings() -> RabbitMqSettings {
    RabbitMqSettings::default()
}

pub fn get_connection_factory() -> ConnectionFactory {
    ConnectionFactory::new_from_config(&get_rabbitmq_settings()).unwrap()
}

/// Small pools with fast recovery, so failure scenarios settle quickly.
pub fn pool_settings() -> PoolSettings {
    PoolSettings {
        min_connections: 1,
        max_connections: 3,
        max_channels_per_connection: 4,
        min_channels: 2,
        max_channels: 12,
        health_check_interval_ms: 20,
        acquire_timeout_ms: 1_000,
        backoff: BackoffSettings {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            retry_ceiling: 5,
        },
        ..PoolSettings::default()
    }
}

pub struct TestPools {
    pub broker: InMemoryBroker,
    pub connections: ConnectionPool<InMemoryBroker>,
    pub channels: ChannelPool<InMemoryBroker>,
}

pub async fn in_memory_pools(settings: PoolSettings) -> TestPools {
    let broker = InMemoryBroker::new();
    let connections = ConnectionPool::new(broker.clone(), settings.clone())
        .await
        .unwrap();
    let channels = ChannelPool::new(connections.clone(), settings)
        .await
        .unwrap();
    TestPools {
        broker,
        connections,
        channels,
    }
}

pub async fn declare_queues<T: carrot_stew::amqp::transport::Transport>(
    channels: &ChannelPool<T>,
    names: &[String],
) {
    let topologer = Topologer::new(channels.clone());
    for name in names {
        topologer
            .create_queue(&QueueDescriptor::new(name.as_str()))
            .await
            .unwrap();
    }
}

pub fn queue_name() -> String {
    format!("test-{}", Uuid::new_v4())
}

/// Poll `condition` until it holds, failing the test after 10 seconds.
pub async fn eventually(condition: impl FnMut() -> bool) {
    assert!(
        within(Duration::from_secs(10), condition).await,
        "condition not met in time"
    );
}

/// Poll `condition` every few milliseconds; `false` if it still fails after `bound`.
pub async fn within(bound: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(bound, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// The longest a supervisor may take to replace a resource the broker is willing to give
/// back: one health tick, then `retry_ceiling` attempts at the capped delay.
pub fn recovery_bound(settings: &PoolSettings) -> Duration {
    Duration::from_millis(settings.backoff.max_delay_ms) * settings.backoff.retry_ceiling
        + settings.health_check_interval()
}

pub async fn next<T>(stream: &EventStream<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), stream.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("the stream closed")
}
