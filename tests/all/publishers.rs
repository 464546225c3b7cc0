use crate::helpers::{declare_queues, in_memory_pools, next, pool_settings};
use carrot_stew::amqp::configuration::{ConsumerSettings, PoolSettings, PublisherSettings};
use carrot_stew::consumers::Consumer;
use carrot_stew::events::ResourceKind;
use carrot_stew::publishers::{Letter, LetterId, PublishError, Publisher, PublisherState};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_hundred_thousand_letters_are_published_and_consumed() {
    // Arrange
    const LETTERS: usize = 100_000;
    let pools = in_memory_pools(pool_settings()).await;
    let queues: Vec<String> = (0..10).map(|i| format!("Queue-{i}")).collect();
    declare_queues(&pools.channels, &queues).await;

    let publisher = Publisher::new(
        pools.channels.clone(),
        PublisherSettings {
            workers: 8,
            ..PublisherSettings::default()
        },
    );
    let notifications = publisher.notifications();
    publisher.start_auto_publish().unwrap();

    let reader = tokio::spawn(async move {
        let mut notified = HashSet::with_capacity(LETTERS);
        let mut failures = 0;
        while notified.len() + failures < LETTERS {
            let notification = notifications.recv().await.unwrap();
            if notification.success() {
                assert!(notified.insert(notification.letter_id), "duplicate notification");
            } else {
                failures += 1;
            }
        }
        (notified, failures)
    });

    // Act
    let mut queued = HashSet::with_capacity(LETTERS);
    for i in 0..LETTERS {
        let letter = Letter::new("", format!("Queue-{}", i % 10), Vec::new());
        queued.insert(letter.id);
        publisher.queue_letter(letter).await.unwrap();
    }
    let (notified, failures) = tokio::time::timeout(Duration::from_secs(120), reader)
        .await
        .expect("not every letter was notified")
        .unwrap();

    publisher.stop_auto_publish().await;
    let per_queue = LETTERS / queues.len();
    let consumers: Vec<Consumer<_>> = queues
        .iter()
        .map(|queue| {
            let consumer =
                Consumer::new(pools.channels.clone(), ConsumerSettings::for_queue(queue.as_str()));
            consumer.start_consuming().unwrap();
            consumer
        })
        .collect();
    let acking: Vec<_> = consumers
        .iter()
        .map(|consumer| {
            let messages = consumer.messages();
            tokio::spawn(async move {
                let mut acked = 0;
                while acked < per_queue {
                    let message = messages.recv().await.unwrap();
                    message.acknowledge().await.unwrap();
                    acked += 1;
                }
                acked
            })
        })
        .collect();

    // Assert
    assert_eq!(failures, 0);
    assert_eq!(notified, queued);
    assert_eq!(publisher.state(), PublisherState::Stopped);
    for (queue, acking) in queues.iter().zip(acking) {
        let acked = tokio::time::timeout(Duration::from_secs(120), acking)
            .await
            .expect("queue was not consumed in time")
            .unwrap();
        assert_eq!(acked, per_queue, "{queue}");
    }
    for consumer in &consumers {
        consumer.stop_consuming(false, true).await;
    }
    assert_eq!(pools.broker.unacked_count(), 0);
    for queue in &queues {
        assert_eq!(pools.broker.message_count(queue), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queueing_blocks_while_the_channel_pool_is_exhausted() {
    // Arrange
    let settings = PoolSettings {
        max_connections: 1,
        max_channels_per_connection: 1,
        min_channels: 1,
        max_channels: 1,
        acquire_timeout_ms: 10_000,
        ..pool_settings()
    };
    let pools = in_memory_pools(settings).await;
    let queue = crate::helpers::queue_name();
    declare_queues(&pools.channels, &[queue.clone()]).await;
    let publisher = Publisher::new(
        pools.channels.clone(),
        PublisherSettings {
            workers: 1,
            letter_buffer: 1,
            acquire_attempts: 1,
            ..PublisherSettings::default()
        },
    );
    let notifications = publisher.notifications();
    publisher.start_auto_publish().unwrap();
    let held = pools.channels.acquire().await.unwrap();

    // Act
    // One letter waits on a channel inside the worker, one fills the buffer.
    publisher
        .queue_letter(Letter::new("", queue.as_str(), "first"))
        .await
        .unwrap();
    publisher
        .queue_letter(Letter::new("", queue.as_str(), "second"))
        .await
        .unwrap();
    let blocked = tokio::spawn({
        let publisher = publisher.clone();
        let queue = queue.clone();
        async move {
            publisher
                .queue_letter(Letter::new("", queue.as_str(), "third"))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    let was_blocked = !blocked.is_finished();
    pools.channels.release(held);

    // Assert
    assert!(was_blocked);
    blocked.await.unwrap().unwrap();
    for _ in 0..3 {
        assert!(next(&notifications).await.success());
    }
    assert_eq!(pools.broker.message_count(&queue), 3);
    publisher.stop_auto_publish().await;
}

#[tokio::test]
async fn a_broken_channel_is_retried_exactly_once() {
    // Arrange
    let pools = in_memory_pools(pool_settings()).await;
    let queue = crate::helpers::queue_name();
    declare_queues(&pools.channels, &[queue.clone()]).await;
    let channel_errors = pools.channels.errors();
    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());
    let notifications = publisher.notifications();
    publisher.start_auto_publish().unwrap();

    // Act
    pools.broker.fail_next_publishes(1);
    publisher
        .queue_letter(Letter::new("", queue.as_str(), "recovered").with_id(1))
        .await
        .unwrap();
    let recovered = next(&notifications).await;

    pools.broker.fail_next_publishes(2);
    publisher
        .queue_letter(Letter::new("", queue.as_str(), "lost").with_id(2))
        .await
        .unwrap();
    let lost = next(&notifications).await;

    // Assert
    assert_eq!(recovered.letter_id, 1);
    assert!(recovered.success());
    assert_eq!(recovered.attempts, 2);

    assert_eq!(lost.letter_id, 2);
    assert_eq!(lost.attempts, 2);
    assert!(matches!(lost.error, Some(PublishError::ChannelFailure(_))));

    assert_eq!(next(&channel_errors).await.kind, ResourceKind::Channel);
    assert_eq!(pools.broker.message_count(&queue), 1);
    publisher.stop_auto_publish().await;
}

#[tokio::test]
async fn stopping_notifies_every_accepted_letter_even_when_the_broker_is_gone() {
    // Arrange
    let pools = in_memory_pools(PoolSettings {
        acquire_timeout_ms: 50,
        ..pool_settings()
    })
    .await;
    let publisher = Publisher::new(
        pools.channels.clone(),
        PublisherSettings {
            acquire_attempts: 1_000,
            stop_timeout_ms: 100,
            ..PublisherSettings::default()
        },
    );
    let notifications = publisher.notifications();
    pools.broker.set_reachable(false);
    pools.broker.kill_connections();

    let letters: Vec<Letter> = (0..10).map(|_| Letter::new("", "nowhere", "x")).collect();
    let queued: HashSet<LetterId> = letters.iter().map(|letter| letter.id).collect();
    publisher.queue_letters(letters).await.unwrap();
    publisher.start_auto_publish().unwrap();

    // Act
    publisher.stop_auto_publish().await;

    // Assert
    let mut notified = HashSet::new();
    while let Some(notification) = notifications.try_recv() {
        assert!(!notification.success());
        assert!(notified.insert(notification.letter_id));
    }
    assert_eq!(notified, queued);
    assert!(matches!(
        publisher.queue_letter(Letter::new("", "nowhere", "late")).await,
        Err(carrot_stew::publishers::PublisherError::Stopped(_))
    ));
}

#[tokio::test]
async fn synchronous_publishes_report_unroutable_messages() {
    let pools = in_memory_pools(pool_settings()).await;
    let publisher = Publisher::new(pools.channels.clone(), PublisherSettings::default());

    let letter = Letter::new("", "missing-queue", "x");
    let envelope = letter.envelope.clone().with_mandatory(true);
    let outcome = publisher.publish(letter.with_envelope(envelope)).await;

    assert!(matches!(
        outcome,
        Err(PublishError::Unroutable { reply_code: 312, .. })
    ));
}
