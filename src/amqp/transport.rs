//! The boundary between the pools/pipelines and the protocol client that actually talks to
//! the broker.
//!
//! Pools, publishers, consumers and the topologer only ever interact with the broker through
//! these traits. [`ConnectionFactory`](super::ConnectionFactory) implements them on top of
//! [`lapin`]; `InMemoryBroker` (behind the `test-util` feature) implements them in-process for tests.
use crate::publishers::Envelope;
use crate::topology::{BindingDescriptor, ExchangeDescriptor, QueueDescriptor};
use amq_protocol_types::{DeliveryTag, ShortString};
use futures_util::stream::BoxStream;
use lapin::BasicProperties;

/// Callback invoked by a connection or a channel when it breaks.
pub type ErrorCallback = Box<dyn FnMut(anyhow::Error) + Send + 'static>;

/// The stream of deliveries produced by a subscription.
///
/// It yields an error (and then ends) if the subscription's channel breaks.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// The channel type produced by the connections of transport `T`.
pub type ChannelOf<T> = <<T as Transport>::Connection as BrokerConnection>::Channel;

/// `Transport` knows how to dial a broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Establish a brand new connection.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A live connection to the broker, capable of multiplexing channels.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// The protocol's own liveness signal (heartbeats included).
    fn is_connected(&self) -> bool;

    /// Register the callback fired when the connection breaks.
    ///
    /// Implementations may keep a single callback: registering again replaces it.
    fn on_error(&self, callback: ErrorCallback);

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Options for opening a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// The broker settles deliveries as soon as it sends them.
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
}

/// The broker's answer to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The message was returned as unroutable (mandatory flag set, no matching queue).
    Returned {
        reply_code: u16,
        reply_text: String,
    },
    /// The channel is not in confirm mode: the broker said nothing.
    NotRequested,
}

/// A protocol channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Register the callback fired when the channel breaks.
    fn on_error(&self, callback: ErrorCallback);

    /// Put the channel in publisher-confirms mode.
    async fn enable_confirms(&self) -> Result<(), anyhow::Error>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    /// Publish `body` and, in confirm mode, wait for the broker to settle it.
    ///
    /// `Err` means the channel failed; refusals by the broker come back as a [`Confirmation`].
    async fn publish(
        &self,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<Confirmation, anyhow::Error>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, anyhow::Error>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), anyhow::Error>;

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<(), anyhow::Error>;

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), anyhow::Error>;

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<(), anyhow::Error>;

    /// Returns the number of messages deleted with the queue.
    async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, anyhow::Error>;

    /// Returns the number of messages purged.
    async fn purge_queue(&self, name: &str) -> Result<u32, anyhow::Error>;

    /// `binding.source` is the exchange, `binding.destination` the queue.
    async fn bind_queue(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error>;

    async fn unbind_queue(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error>;

    async fn bind_exchange(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error>;

    async fn unbind_exchange(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error>;
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge the message.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}
