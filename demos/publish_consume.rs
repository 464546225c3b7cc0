use carrot_stew::amqp::configuration::{ConsumerSettings, PoolSettings, PublisherSettings, RabbitMqSettings};
use carrot_stew::amqp::ConnectionFactory;
use carrot_stew::consumers::Consumer;
use carrot_stew::pool::{ChannelPool, ConnectionPool};
use carrot_stew::publishers::{Letter, Publisher};
use carrot_stew::topology::{BindingDescriptor, ExchangeDescriptor, ExchangeKind, QueueDescriptor, Topologer};

const MESSAGES: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();
    let connection_factory = ConnectionFactory::new_from_config(&settings)?;

    // Both pools open their minimum number of resources eagerly: if the broker is not
    // reachable we find out here.
    // From now on broken connections and channels are replaced in the background.
    let pool_settings = PoolSettings::default();
    let connections = ConnectionPool::new(connection_factory, pool_settings.clone()).await?;
    let channels = ChannelPool::new(connections.clone(), pool_settings).await?;

    // Declare a topic exchange with a queue bound to it.
    let topologer = Topologer::new(channels.clone());
    topologer
        .create_exchange(&ExchangeDescriptor::new("demo-exchange", ExchangeKind::Topic))
        .await?;
    topologer
        .create_queue(&QueueDescriptor::new("demo-queue"))
        .await?;
    topologer
        .bind_queue(&BindingDescriptor::new("demo-exchange", "demo-queue", "greetings.*"))
        .await?;

    // The consumer surfaces each delivery as a message that must be settled explicitly.
    let consumer = Consumer::new(channels.clone(), ConsumerSettings::for_queue("demo-queue"));
    let messages = consumer.messages();
    consumer.start_consuming()?;

    // The publisher takes letters into a buffer and publishes them with its own workers.
    // Each letter gets exactly one notification telling us how it went.
    let publisher = Publisher::new(channels.clone(), PublisherSettings::default());
    let notifications = publisher.notifications();
    publisher.start_auto_publish()?;
    for i in 0..MESSAGES {
        let letter = Letter::new("demo-exchange", "greetings.world", format!("Hello #{i}"));
        publisher.queue_letter(letter).await?;
    }
    for _ in 0..MESSAGES {
        if let Some(notification) = notifications.recv().await {
            println!("{notification}");
        }
    }

    for _ in 0..MESSAGES {
        let Some(message) = messages.recv().await else {
            break;
        };
        println!("Received: {}", String::from_utf8_lossy(message.body()));
        message.acknowledge().await?;
    }

    // Stop accepting new work, then shut the pools down.
    publisher.stop_auto_publish().await;
    consumer.stop_consuming(false, true).await;
    topologer.delete_queue("demo-queue", false, false).await?;
    topologer.delete_exchange("demo-exchange", false).await?;
    channels.shutdown().await;
    connections.shutdown().await;
    Ok(())
}
