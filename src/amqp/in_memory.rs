//! An in-process broker, to exercise pools and pipelines without a running RabbitMQ.
//!
//! It implements the same [`Transport`] boundary as [`ConnectionFactory`], with the subset
//! of broker semantics the rest of the crate relies on: exchanges (default, `direct`,
//! `fanout`, `topic`, and `headers` routed like `fanout`), queues, queue and exchange
//! bindings, publisher confirms, mandatory returns, prefetch, and per-channel
//! acknowledgement tags. Protocol violations close the offending channel, like a real broker
//! does, and closed channels hand their unacknowledged deliveries back to their queues.
//!
//! [`ConnectionFactory`]: super::ConnectionFactory
use crate::amqp::transport::{
    BrokerChannel, BrokerConnection, ConsumeOptions, Confirmation, Delivery, DeliveryStream,
    ErrorCallback, Transport,
};
use crate::publishers::Envelope;
use crate::topology::{BindingDescriptor, ExchangeDescriptor, ExchangeKind, QueueDescriptor};
use amq_protocol_types::{DeliveryTag, ShortString};
use futures_util::StreamExt;
use lapin::BasicProperties;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A broker living in the current process.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// Error callbacks to fire once the state lock has been released.
type Fired = Vec<(ErrorCallback, String)>;

struct BrokerState {
    reachable: bool,
    next_connection_id: u64,
    next_channel_id: u64,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    exchanges: BTreeMap<String, ExchangeDescriptor>,
    queues: BTreeMap<String, QueueState>,
    queue_bindings: Vec<BindingDescriptor>,
    exchange_bindings: Vec<BindingDescriptor>,
    failing_publishes: usize,
    nacked_publishes: usize,
    subscribe_delay: Duration,
    published: u64,
}

struct ConnectionState {
    open: bool,
    on_error: Option<ErrorCallback>,
}

struct ChannelState {
    connection_id: u64,
    open: bool,
    confirms: bool,
    prefetch: u16,
    on_error: Option<ErrorCallback>,
    next_delivery_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, (String, StoredMessage)>,
}

struct QueueState {
    descriptor: QueueDescriptor,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    next_consumer: usize,
}

struct ConsumerState {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    exclusive: bool,
    deliveries: mpsc::UnboundedSender<Result<Delivery, anyhow::Error>>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: ShortString,
    routing_key: ShortString,
    properties: BasicProperties,
    body: Vec<u8>,
    redelivered: bool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                next_connection_id: 1,
                next_channel_id: 1,
                connections: HashMap::new(),
                channels: HashMap::new(),
                exchanges: BTreeMap::new(),
                queues: BTreeMap::new(),
                queue_bindings: Vec::new(),
                exchange_bindings: Vec::new(),
                failing_publishes: 0,
                nacked_publishes: 0,
                subscribe_delay: Duration::ZERO,
                published: 0,
            })),
        }
    }

    /// Drop every open connection, as a network partition or a broker restart would.
    ///
    /// Connections and channels fire their error callbacks, and consumers see their
    /// delivery streams fail.
    pub fn kill_connections(&self) {
        let mut fired = Fired::new();
        {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, connection)| connection.open)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                state.close_connection(
                    id,
                    Some("CONNECTION_FORCED - broker forced connection closure"),
                    &mut fired,
                );
            }
        }
        fire(fired);
    }

    /// While unreachable, every attempt to connect fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Make the next `count` publishes fail at the channel level, closing their channel.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().failing_publishes = count;
    }

    /// Make the broker refuse (nack) the next `count` publishes.
    pub fn nack_next_publishes(&self, count: usize) {
        self.state.lock().nacked_publishes = count;
    }

    /// Hold every `consume` for `delay` after the consumer is registered, like a slow
    /// `consume-ok` from a real broker.
    pub fn delay_subscriptions(&self, delay: Duration) {
        self.state.lock().subscribe_delay = delay;
    }

    pub fn exchanges(&self) -> Vec<ExchangeDescriptor> {
        self.state.lock().exchanges.values().cloned().collect()
    }

    pub fn queues(&self) -> Vec<QueueDescriptor> {
        self.state
            .lock()
            .queues
            .values()
            .map(|queue| queue.descriptor.clone())
            .collect()
    }

    pub fn queue_bindings(&self) -> Vec<BindingDescriptor> {
        self.state.lock().queue_bindings.clone()
    }

    pub fn exchange_bindings(&self) -> Vec<BindingDescriptor> {
        self.state.lock().exchange_bindings.clone()
    }

    /// Messages ready for delivery in `queue` (delivered but unacknowledged ones excluded).
    pub fn message_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Delivered messages waiting for an acknowledgement, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// Publishes accepted for routing so far.
    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|connection| connection.open)
            .count()
    }

    pub fn open_channels(&self) -> usize {
        let state = self.state.lock();
        state
            .channels
            .keys()
            .filter(|id| state.channel_is_open(**id))
            .count()
    }

    /// Run `operation` against an open channel, then fire the callbacks it queued.
    fn on_channel<R>(
        &self,
        channel_id: u64,
        operation: impl FnOnce(&mut BrokerState, &mut Fired) -> Result<R, anyhow::Error>,
    ) -> Result<R, anyhow::Error> {
        let mut fired = Fired::new();
        let result = {
            let mut state = self.state.lock();
            if state.channel_is_open(channel_id) {
                operation(&mut state, &mut fired)
            } else {
                Err(anyhow::anyhow!("channel {channel_id} is closed"))
            }
        };
        fire(fired);
        result
    }
}

fn fire(fired: Fired) {
    for (mut callback, reason) in fired {
        callback(anyhow::anyhow!(reason));
    }
}

impl BrokerState {
    fn channel_is_open(&self, channel_id: u64) -> bool {
        self.channels.get(&channel_id).map_or(false, |channel| {
            channel.open
                && self
                    .connections
                    .get(&channel.connection_id)
                    .map_or(false, |connection| connection.open)
        })
    }

    fn close_connection(&mut self, connection_id: u64, error: Option<&str>, fired: &mut Fired) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        connection.open = false;
        if let (Some(reason), Some(callback)) = (error, connection.on_error.take()) {
            fired.push((callback, reason.to_owned()));
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection_id == connection_id && channel.open)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id, error, fired);
        }
    }

    /// Close a channel, requeueing whatever it left unacknowledged. With an `error`, the
    /// channel's callback fires and its consumers see their stream fail.
    fn close_channel(&mut self, channel_id: u64, error: Option<&str>, fired: &mut Fired) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        if let (Some(reason), Some(callback)) = (error, channel.on_error.take()) {
            fired.push((callback, reason.to_owned()));
        }
        let unacked = std::mem::take(&mut channel.unacked);

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| {
                if consumer.channel_id != channel_id {
                    return true;
                }
                if let Some(reason) = error {
                    let _ = consumer.deliveries.send(Err(anyhow::anyhow!(reason.to_owned())));
                }
                false
            });
        }
        for (queue, mut message) in unacked.into_values().rev() {
            if let Some(queue) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
        self.dispatch_all();
    }

    /// Close the channel the way a broker does on a protocol violation.
    fn channel_error(
        &mut self,
        channel_id: u64,
        reply_code: u16,
        reply_text: String,
        fired: &mut Fired,
    ) -> anyhow::Error {
        let reason = format!("channel error {reply_code}: {reply_text}");
        self.close_channel(channel_id, Some(&reason), fired);
        anyhow::anyhow!(reason)
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    /// Hand ready messages of `queue_name` to its consumers, round-robin, within prefetch.
    fn dispatch(&mut self, queue_name: &str) {
        let Self {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let eligible = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|index| {
                    let consumer = &queue.consumers[*index];
                    channels.get(&consumer.channel_id).map_or(false, |channel| {
                        channel.open
                            && (consumer.no_ack
                                || channel.prefetch == 0
                                || channel.unacked.len() < usize::from(channel.prefetch))
                    })
                });
            let Some(index) = eligible else {
                return;
            };
            queue.next_consumer = (index + 1) % count;

            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            let consumer = &queue.consumers[index];
            let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                return;
            };
            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.body.clone(),
            };
            if consumer.deliveries.send(Ok(delivery)).is_err() {
                // Nobody reads this subscription anymore.
                queue.consumers.remove(index);
                queue.next_consumer = 0;
                queue.messages.push_front(message);
                continue;
            }
            if !consumer.no_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue_name.to_owned(), message));
            }
        }
    }

    /// The queues a message published on `exchange` with `routing_key` ends up in.
    fn route(&self, exchange: &str, routing_key: &str) -> BTreeSet<String> {
        let mut queues = BTreeSet::new();
        if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                queues.insert(routing_key.to_owned());
            }
            return queues;
        }
        let mut visited = BTreeSet::new();
        let mut pending = vec![exchange.to_owned()];
        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(kind) = self.exchanges.get(&name).map(|exchange| &exchange.kind) else {
                continue;
            };
            for binding in self.queue_bindings.iter().filter(|b| b.source == name) {
                if binding_matches(kind, &binding.routing_key, routing_key) {
                    queues.insert(binding.destination.clone());
                }
            }
            for binding in self.exchange_bindings.iter().filter(|b| b.source == name) {
                if binding_matches(kind, &binding.routing_key, routing_key) {
                    pending.push(binding.destination.clone());
                }
            }
        }
        queues
    }

    fn settle(
        &mut self,
        channel_id: u64,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
        fired: &mut Fired,
    ) -> Result<(), anyhow::Error> {
        let known = self
            .channels
            .get(&channel_id)
            .map_or(false, |channel| channel.unacked.contains_key(&delivery_tag));
        if !known {
            return Err(self.channel_error(
                channel_id,
                406,
                format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"),
                fired,
            ));
        }
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return Ok(());
        };
        let settled: Vec<(String, StoredMessage)> = if multiple {
            let tags: Vec<DeliveryTag> = channel
                .unacked
                .range(..=delivery_tag)
                .map(|(tag, _)| *tag)
                .collect();
            tags.iter()
                .filter_map(|tag| channel.unacked.remove(tag))
                .collect()
        } else {
            channel.unacked.remove(&delivery_tag).into_iter().collect()
        };
        if requeue {
            for (queue, mut message) in settled.into_iter().rev() {
                if let Some(queue) = self.queues.get_mut(&queue) {
                    message.redelivered = true;
                    queue.messages.push_front(message);
                }
            }
        }
        self.dispatch_all();
        Ok(())
    }
}

fn binding_matches(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
        ExchangeKind::Direct | ExchangeKind::Custom(_) => binding_key == routing_key,
    }
}

/// `*` matches exactly one word, `#` matches zero or more words.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], words: &[&str]) -> bool {
        match pattern.split_first() {
            None => words.is_empty(),
            Some((&"#", rest)) => (0..=words.len()).any(|skip| matches(rest, &words[skip..])),
            Some((&"*", rest)) => !words.is_empty() && matches(rest, &words[1..]),
            Some((word, rest)) => words.first() == Some(word) && matches(rest, &words[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &words)
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

/// A channel opened on an [`InMemoryConnection`].
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait::async_trait]
impl Transport for InMemoryBroker {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection, anyhow::Error> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(anyhow::anyhow!("Connection refused: the broker is unreachable"));
        }
        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                on_error: None,
            },
        );
        Ok(InMemoryConnection {
            broker: self.clone(),
            id,
        })
    }
}

#[async_trait::async_trait]
impl BrokerConnection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> Result<InMemoryChannel, anyhow::Error> {
        let mut state = self.broker.state.lock();
        if !state
            .connections
            .get(&self.id)
            .map_or(false, |connection| connection.open)
        {
            return Err(anyhow::anyhow!("connection {} is closed", self.id));
        }
        let id = state.next_channel_id;
        state.next_channel_id += 1;
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                open: true,
                confirms: false,
                prefetch: 0,
                on_error: None,
                next_delivery_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        })
    }

    fn is_connected(&self) -> bool {
        self.broker
            .state
            .lock()
            .connections
            .get(&self.id)
            .map_or(false, |connection| connection.open)
    }

    fn on_error(&self, callback: ErrorCallback) {
        if let Some(connection) = self.broker.state.lock().connections.get_mut(&self.id) {
            connection.on_error = Some(callback);
        }
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        let mut fired = Fired::new();
        self.broker
            .state
            .lock()
            .close_connection(self.id, None, &mut fired);
        fire(fired);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.state.lock().channel_is_open(self.id)
    }

    fn on_error(&self, callback: ErrorCallback) {
        if let Some(channel) = self.broker.state.lock().channels.get_mut(&self.id) {
            channel.on_error = Some(callback);
        }
    }

    async fn enable_confirms(&self) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, _| {
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.confirms = true;
            }
            Ok(())
        })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, _| {
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.prefetch = prefetch_count;
            }
            state.dispatch_all();
            Ok(())
        })
    }

    async fn publish(
        &self,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<Confirmation, anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(state.channel_error(
                    self.id,
                    541,
                    "INTERNAL_ERROR - injected publish failure".into(),
                    fired,
                ));
            }
            if !envelope.exchange.is_empty() && !state.exchanges.contains_key(&envelope.exchange)
            {
                return Err(state.channel_error(
                    self.id,
                    404,
                    format!("NOT_FOUND - no exchange '{}'", envelope.exchange),
                    fired,
                ));
            }
            let confirms = state
                .channels
                .get(&self.id)
                .map_or(false, |channel| channel.confirms);
            let unconfirmed = |confirmation| {
                if confirms {
                    confirmation
                } else {
                    Confirmation::NotRequested
                }
            };

            if state.nacked_publishes > 0 {
                state.nacked_publishes -= 1;
                return Ok(unconfirmed(Confirmation::Nack));
            }
            state.published += 1;

            let destinations = state.route(&envelope.exchange, &envelope.routing_key);
            if destinations.is_empty() && envelope.mandatory {
                return Ok(unconfirmed(Confirmation::Returned {
                    reply_code: 312,
                    reply_text: "NO_ROUTE".into(),
                }));
            }
            let message = StoredMessage {
                exchange: envelope.exchange.as_str().into(),
                routing_key: envelope.routing_key.as_str().into(),
                properties: envelope.properties.clone(),
                body: body.to_vec(),
                redelivered: false,
            };
            for destination in &destinations {
                if let Some(queue) = state.queues.get_mut(destination) {
                    queue.messages.push_back(message.clone());
                }
                state.dispatch(destination);
            }
            Ok(unconfirmed(Confirmation::Ack))
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let receiver = self.broker.on_channel(self.id, |state, fired| {
            let Some(target) = state.queues.get(queue) else {
                return Err(state.channel_error(
                    self.id,
                    404,
                    format!("NOT_FOUND - no queue '{queue}'"),
                    fired,
                ));
            };
            let locked = target
                .consumers
                .iter()
                .any(|consumer| consumer.exclusive || options.exclusive);
            if locked {
                return Err(state.channel_error(
                    self.id,
                    403,
                    format!("ACCESS_REFUSED - queue '{queue}' in exclusive use"),
                    fired,
                ));
            }
            let duplicate = state.queues.values().any(|queue| {
                queue
                    .consumers
                    .iter()
                    .any(|consumer| consumer.channel_id == self.id && consumer.tag == consumer_tag)
            });
            if duplicate {
                return Err(state.channel_error(
                    self.id,
                    530,
                    format!("NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"),
                    fired,
                ));
            }

            let (sender, receiver) = mpsc::unbounded_channel();
            if let Some(target) = state.queues.get_mut(queue) {
                target.consumers.push(ConsumerState {
                    tag: consumer_tag.to_owned(),
                    channel_id: self.id,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    deliveries: sender,
                });
            }
            state.dispatch(queue);
            Ok(receiver)
        })?;
        let delay = self.broker.state.lock().subscribe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, _| {
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|consumer| {
                    !(consumer.channel_id == self.id && consumer.tag == consumer_tag)
                });
            }
            Ok(())
        })
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            state.settle(self.id, delivery_tag, multiple, false, fired)
        })
    }

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            state.settle(self.id, delivery_tag, multiple, requeue, fired)
        })
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            state.settle(self.id, delivery_tag, false, requeue, fired)
        })
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        let mut fired = Fired::new();
        self.broker
            .state
            .lock()
            .close_channel(self.id, None, &mut fired);
        fire(fired);
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            if exchange.name.is_empty() || exchange.name.starts_with("amq.") {
                return Err(state.channel_error(
                    self.id,
                    403,
                    format!("ACCESS_REFUSED - exchange name '{}' is reserved", exchange.name),
                    fired,
                ));
            }
            let declared = ExchangeDescriptor {
                passive: false,
                no_wait: false,
                ..exchange.clone()
            };
            match state.exchanges.get(&exchange.name).cloned() {
                Some(_) if exchange.passive => Ok(()),
                Some(existing) if existing != declared => Err(state.channel_error(
                    self.id,
                    406,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                        exchange.name
                    ),
                    fired,
                )),
                Some(_) => Ok(()),
                None if exchange.passive => Err(state.channel_error(
                    self.id,
                    404,
                    format!("NOT_FOUND - no exchange '{}'", exchange.name),
                    fired,
                )),
                None => {
                    state.exchanges.insert(exchange.name.clone(), declared);
                    Ok(())
                }
            }
        })
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            let in_use = state.queue_bindings.iter().any(|b| b.source == name)
                || state.exchange_bindings.iter().any(|b| b.source == name);
            if if_unused && in_use {
                return Err(state.channel_error(
                    self.id,
                    406,
                    format!("PRECONDITION_FAILED - exchange '{name}' in use"),
                    fired,
                ));
            }
            state.exchanges.remove(name);
            state.queue_bindings.retain(|b| b.source != name);
            state
                .exchange_bindings
                .retain(|b| b.source != name && b.destination != name);
            Ok(())
        })
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            let mut declared = QueueDescriptor {
                passive: false,
                no_wait: false,
                ..queue.clone()
            };
            if declared.name.is_empty() {
                declared.name = format!("amq.gen-{}", uuid::Uuid::new_v4());
            }
            let existing = state
                .queues
                .get(&declared.name)
                .map(|existing| existing.descriptor.clone());
            match existing {
                Some(_) if queue.passive => Ok(()),
                Some(existing) if existing != declared => Err(state.channel_error(
                    self.id,
                    406,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                        declared.name
                    ),
                    fired,
                )),
                Some(_) => Ok(()),
                None if queue.passive => Err(state.channel_error(
                    self.id,
                    404,
                    format!("NOT_FOUND - no queue '{}'", declared.name),
                    fired,
                )),
                None => {
                    state.queues.insert(
                        declared.name.clone(),
                        QueueState {
                            descriptor: declared,
                            messages: VecDeque::new(),
                            consumers: Vec::new(),
                            next_consumer: 0,
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            let Some((in_use, non_empty)) = state
                .queues
                .get(name)
                .map(|queue| (!queue.consumers.is_empty(), !queue.messages.is_empty()))
            else {
                return Ok(0);
            };
            if if_unused && in_use {
                return Err(state.channel_error(
                    self.id,
                    406,
                    format!("PRECONDITION_FAILED - queue '{name}' in use"),
                    fired,
                ));
            }
            if if_empty && non_empty {
                return Err(state.channel_error(
                    self.id,
                    406,
                    format!("PRECONDITION_FAILED - queue '{name}' not empty"),
                    fired,
                ));
            }
            let removed = state
                .queues
                .remove(name)
                .map_or(0, |queue| queue.messages.len());
            state.queue_bindings.retain(|b| b.destination != name);
            Ok(u32::try_from(removed).unwrap_or(u32::MAX))
        })
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            match state.queues.get_mut(name) {
                Some(queue) => {
                    let purged = queue.messages.len();
                    queue.messages.clear();
                    Ok(u32::try_from(purged).unwrap_or(u32::MAX))
                }
                None => Err(state.channel_error(
                    self.id,
                    404,
                    format!("NOT_FOUND - no queue '{name}'"),
                    fired,
                )),
            }
        })
    }

    async fn bind_queue(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            if binding.source.is_empty() {
                return Err(state.channel_error(
                    self.id,
                    403,
                    "ACCESS_REFUSED - operation not permitted on the default exchange".into(),
                    fired,
                ));
            }
            if !state.exchanges.contains_key(&binding.source) {
                return Err(state.channel_error(
                    self.id,
                    404,
                    format!("NOT_FOUND - no exchange '{}'", binding.source),
                    fired,
                ));
            }
            if !state.queues.contains_key(&binding.destination) {
                return Err(state.channel_error(
                    self.id,
                    404,
                    format!("NOT_FOUND - no queue '{}'", binding.destination),
                    fired,
                ));
            }
            add_binding(&mut state.queue_bindings, binding);
            Ok(())
        })
    }

    async fn unbind_queue(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, _| {
            remove_binding(&mut state.queue_bindings, binding);
            Ok(())
        })
    }

    async fn bind_exchange(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, fired| {
            for name in [&binding.source, &binding.destination] {
                if !state.exchanges.contains_key(name) {
                    return Err(state.channel_error(
                        self.id,
                        404,
                        format!("NOT_FOUND - no exchange '{name}'"),
                        fired,
                    ));
                }
            }
            add_binding(&mut state.exchange_bindings, binding);
            Ok(())
        })
    }

    async fn unbind_exchange(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error> {
        self.broker.on_channel(self.id, |state, _| {
            remove_binding(&mut state.exchange_bindings, binding);
            Ok(())
        })
    }
}

fn same_binding(a: &BindingDescriptor, b: &BindingDescriptor) -> bool {
    a.source == b.source
        && a.destination == b.destination
        && a.routing_key == b.routing_key
        && a.arguments == b.arguments
}

fn add_binding(bindings: &mut Vec<BindingDescriptor>, binding: &BindingDescriptor) {
    if !bindings.iter().any(|existing| same_binding(existing, binding)) {
        bindings.push(BindingDescriptor {
            no_wait: false,
            ..binding.clone()
        });
    }
}

fn remove_binding(bindings: &mut Vec<BindingDescriptor>, binding: &BindingDescriptor) {
    bindings.retain(|existing| !same_binding(existing, binding));
}
