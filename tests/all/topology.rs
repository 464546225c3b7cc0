use crate::helpers::{in_memory_pools, pool_settings};
use carrot_stew::amqp::configuration::PublisherSettings;
use carrot_stew::publishers::{Letter, Publisher};
use carrot_stew::topology::{BindingDescriptor, ExchangeKind, Topologer, TopologyConfig};
use std::collections::HashSet;

fn config() -> TopologyConfig {
    serde_json::from_value(serde_json::json!({
        "exchanges": [
            { "name": "orders", "type": "topic", "durable": true },
            { "name": "audit", "type": "fanout" }
        ],
        "queues": [
            { "name": "orders.created", "durable": true, "arguments": { "x-message-ttl": 60000 } },
            { "name": "orders.cancelled" },
            { "name": "audit.all" }
        ],
        "exchange_bindings": [
            { "source": "orders", "destination": "audit", "routing_key": "#" }
        ],
        "queue_bindings": [
            { "source": "orders", "destination": "orders.created", "routing_key": "created.*" },
            { "source": "orders", "destination": "orders.cancelled", "routing_key": "cancelled.*" },
            { "source": "audit", "destination": "audit.all", "routing_key": "" }
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn a_built_topology_reads_back_as_declared() {
    // Arrange
    let pools = in_memory_pools(pool_settings()).await;
    let topologer = Topologer::new(pools.channels.clone());
    let config = config();

    // Act
    topologer.build_topology(&config, false).await.unwrap();

    // Assert
    let exchanges: HashSet<String> = pools
        .broker
        .exchanges()
        .into_iter()
        .map(|exchange| exchange.name)
        .collect();
    let queues: HashSet<String> = pools
        .broker
        .queues()
        .into_iter()
        .map(|queue| queue.name)
        .collect();
    assert_eq!(exchanges, HashSet::from(["orders".to_owned(), "audit".to_owned()]));
    assert_eq!(
        queues,
        config.queues.iter().map(|queue| queue.name.clone()).collect()
    );
    assert_eq!(pools.broker.queue_bindings(), config.queue_bindings);
    assert_eq!(pools.broker.exchange_bindings(), config.exchange_bindings);
    assert!(pools
        .broker
        .exchanges()
        .iter()
        .any(|exchange| exchange.name == "orders" && exchange.kind == ExchangeKind::Topic));

    // Building the same topology again is a no-op.
    topologer.build_topology(&config, false).await.unwrap();
    assert_eq!(pools.broker.queue_bindings().len(), 3);
}

#[tokio::test]
async fn unbinding_removes_only_that_binding() {
    // Arrange
    let pools = in_memory_pools(pool_settings()).await;
    let topologer = Topologer::new(pools.channels.clone());
    topologer.build_topology(&config(), false).await.unwrap();
    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());

    // Act
    topologer
        .unbind_queue(&BindingDescriptor::new(
            "orders",
            "orders.created",
            "created.*",
        ))
        .await
        .unwrap();
    publisher
        .publish(Letter::new("orders", "created.eu", "created"))
        .await
        .unwrap();
    publisher
        .publish(Letter::new("orders", "cancelled.eu", "cancelled"))
        .await
        .unwrap();

    // Assert
    let remaining: Vec<BindingDescriptor> = pools.broker.queue_bindings();
    assert_eq!(remaining.len(), 2);
    assert!(remaining
        .iter()
        .all(|binding| binding.destination != "orders.created"));
    assert_eq!(pools.broker.message_count("orders.created"), 0);
    assert_eq!(pools.broker.message_count("orders.cancelled"), 1);
    // Both letters still reach the audit queue through the exchange binding.
    assert_eq!(pools.broker.message_count("audit.all"), 2);
}

#[tokio::test]
async fn exchanges_and_queues_can_be_torn_down() {
    let pools = in_memory_pools(pool_settings()).await;
    let topologer = Topologer::new(pools.channels.clone());
    topologer.build_topology(&config(), false).await.unwrap();

    topologer
        .unbind_exchange(&BindingDescriptor::new("orders", "audit", "#"))
        .await
        .unwrap();
    topologer.delete_queue("audit.all", false, false).await.unwrap();
    topologer.delete_exchange("audit", false).await.unwrap();

    assert!(pools.broker.exchange_bindings().is_empty());
    assert!(pools.broker.queues().iter().all(|queue| queue.name != "audit.all"));
    assert!(pools.broker.exchanges().iter().all(|exchange| exchange.name != "audit"));
}
