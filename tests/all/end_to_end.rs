use crate::helpers::{
    declare_queues, eventually, in_memory_pools, next, pool_settings, queue_name, recovery_bound,
    within,
};
use carrot_stew::amqp::configuration::{ConsumerSettings, PublisherSettings};
use carrot_stew::consumers::{Consumer, ConsumerState};
use carrot_stew::events::ResourceKind;
use carrot_stew::publishers::{Letter, Publisher, PublisherState};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn traffic_resumes_after_the_connection_is_killed_mid_stream() {
    // Arrange
    const LETTERS: usize = 2_000;
    let settings = pool_settings();
    let pools = in_memory_pools(settings.clone()).await;
    let queue = queue_name();
    declare_queues(&pools.channels, &[queue.clone()]).await;
    let connection_errors = pools.connections.errors();

    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());
    publisher.start_auto_publish().unwrap();
    let outcomes = tokio::spawn({
        let notifications = publisher.notifications();
        async move {
            let mut published = HashSet::new();
            let mut failures = 0;
            while published.len() + failures < LETTERS {
                let notification = notifications.recv().await.unwrap();
                if notification.success() {
                    published.insert(notification.letter_id.to_string().into_bytes());
                } else {
                    failures += 1;
                }
            }
            (published, failures)
        }
    });

    let consumer = Consumer::new(
        pools.channels.clone(),
        ConsumerSettings {
            subscriptions: 2,
            sleep_on_error_ms: 20,
            ..ConsumerSettings::for_queue(queue.as_str())
        },
    );
    consumer.start_consuming().unwrap();
    let consumed = Arc::new(Mutex::new(HashSet::new()));
    let reader = tokio::spawn({
        let messages = consumer.messages();
        let consumed = Arc::clone(&consumed);
        async move {
            while let Some(message) = messages.recv().await {
                // Deliveries from a killed channel cannot be acknowledged; the broker redelivers them.
                if message.acknowledge().await.is_ok() {
                    consumed.lock().insert(message.body().to_vec());
                }
            }
        }
    });

    // Act
    let mut recovery = None;
    for i in 0..LETTERS {
        if i == LETTERS / 2 {
            pools.broker.kill_connections();
            let connections = pools.connections.clone();
            let bound = recovery_bound(&settings);
            recovery = Some(tokio::spawn(async move {
                within(bound, || connections.status().healthy >= 1).await
            }));
        }
        let letter = Letter::new("", queue.as_str(), i.to_string()).with_id(i as u64);
        publisher.queue_letter(letter).await.unwrap();
    }
    let (published, failures) = tokio::time::timeout(Duration::from_secs(60), outcomes)
        .await
        .expect("not every letter was notified")
        .unwrap();

    // Assert
    assert_eq!(published.len() + failures, LETTERS);
    assert!(!published.is_empty());
    assert_eq!(next(&connection_errors).await.kind, ResourceKind::Connection);
    let recovered = recovery.expect("connections were never killed").await.unwrap();
    assert!(recovered, "no healthy connection within {:?}", recovery_bound(&settings));
    eventually(|| published.is_subset(&consumed.lock())).await;
    assert_eq!(publisher.state(), PublisherState::Publishing);
    assert_eq!(consumer.state(), ConsumerState::Consuming);

    publisher.stop_auto_publish().await;
    consumer.stop_consuming(false, true).await;
    reader.abort();
}
