use super::message::Session;
use super::{ConsumerError, Message};
use crate::amqp::configuration::{ConsumerSettings, Settings};
use crate::amqp::transport::{BrokerChannel, ConsumeOptions, DeliveryStream, Transport};
use crate::amqp::ConnectionFactory;
use crate::events::{EventSink, EventStream, ResourceError, ResourceKind};
use crate::pool::recovery::shutdown_signalled;
use crate::pool::{ChannelPool, PooledChannel};
use anyhow::anyhow;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    /// Stop was requested and the subscriptions are winding down.
    Stopping,
    Stopped,
}

/// An auto-consuming subscription to a queue, on top of a [`ChannelPool`].
///
/// Each subscription borrows its own channel, sets its prefetch count and forwards every
/// delivery as a [`Message`] on [`messages`](Self::messages). When the channel breaks, the
/// failure is reported on [`errors`](Self::errors), the channel is flagged and the
/// subscription is re-opened on a fresh one after `sleep_on_error`.
pub struct Consumer<T: Transport = ConnectionFactory> {
    inner: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Shared<T: Transport> {
    channels: ChannelPool<T>,
    settings: ConsumerSettings,
    state: Mutex<ConsumerState>,
    stop: watch::Sender<bool>,
    session: Arc<Session>,
    messages_tx: mpsc::Sender<Message<T>>,
    messages: EventStream<Message<T>>,
    errors: EventSink<ResourceError>,
    error_stream: EventStream<ResourceError>,
    subscriptions: Mutex<JoinSet<Option<PooledChannel<T>>>>,
    stopped: watch::Sender<bool>,
}

impl<T: Transport> Consumer<T> {
    pub fn new(channels: ChannelPool<T>, settings: ConsumerSettings) -> Self {
        let (messages_tx, messages_rx) = mpsc::channel(settings.message_buffer.max(1));
        let (errors, error_stream) = EventSink::new(settings.error_buffer);
        let (stop, _) = watch::channel(false);
        let (stopped, _) = watch::channel(false);

        Self {
            inner: Arc::new(Shared {
                channels,
                settings,
                state: Mutex::new(ConsumerState::Idle),
                stop,
                session: Arc::new(Session::default()),
                messages_tx,
                messages: EventStream::from_receiver(messages_rx),
                errors,
                error_stream,
                subscriptions: Mutex::new(JoinSet::new()),
                stopped,
            }),
        }
    }

    /// Build the consumer registered under `name` in `settings.consumers`.
    pub fn from_settings(
        channels: ChannelPool<T>,
        settings: &Settings,
        name: &str,
    ) -> Result<Self, ConsumerError> {
        let mut consumer_settings = settings
            .consumers
            .get(name)
            .cloned()
            .ok_or_else(|| ConsumerError::UnknownConsumer(name.to_owned()))?;
        consumer_settings
            .consumer_name
            .get_or_insert_with(|| name.to_owned());
        Ok(Self::new(channels, consumer_settings))
    }

    /// Open the subscriptions. Starting a consumer that is already consuming does nothing.
    pub fn start_consuming(&self) -> Result<(), ConsumerError> {
        let mut state = self.inner.state.lock();
        match *state {
            ConsumerState::Consuming => return Ok(()),
            ConsumerState::Stopping | ConsumerState::Stopped => {
                return Err(ConsumerError::AlreadyStopped)
            }
            ConsumerState::Idle => {}
        }
        *state = ConsumerState::Consuming;

        let mut subscriptions = self.inner.subscriptions.lock();
        for subscription in 0..self.inner.settings.subscriptions.max(1) {
            subscriptions.spawn(subscribe(
                subscription,
                Arc::clone(&self.inner),
                self.inner.stop.subscribe(),
            ));
        }
        debug!(
            queue = %self.inner.settings.queue_name,
            subscriptions = self.inner.settings.subscriptions.max(1),
            "Consumer started"
        );
        Ok(())
    }

    /// Cancel the subscriptions and close their channels, so that the broker redelivers
    /// whatever was left unacknowledged.
    ///
    /// With `drain`, the channels stay open until every surfaced message is settled (or
    /// dropped), for up to `drain_timeout`. Without it, they are closed straight away and
    /// unsettled messages fail with [`MessageError::Orphaned`](super::MessageError::Orphaned).
    ///
    /// With `no_wait`, this returns as soon as the stop is signalled; the state reaches
    /// [`ConsumerState::Stopped`] once the subscriptions are done.
    ///
    /// Calling it more than once is a no-op.
    #[tracing::instrument(name = "consumer_stop", skip(self), fields(queue = %self.inner.settings.queue_name))]
    pub async fn stop_consuming(&self, no_wait: bool, drain: bool) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConsumerState::Stopping | ConsumerState::Stopped => return,
                ConsumerState::Idle => {
                    *state = ConsumerState::Stopped;
                    self.inner.session.orphan();
                    self.inner.stopped.send_replace(true);
                    return;
                }
                ConsumerState::Consuming => *state = ConsumerState::Stopping,
            }
        }
        self.inner.stop.send_replace(true);

        let finishing = finish(Arc::clone(&self.inner), drain);
        if no_wait {
            tokio::spawn(finishing);
        } else {
            finishing.await;
        }
    }

    /// Resolves once the consumer reached [`ConsumerState::Stopped`].
    pub async fn stopped(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        shutdown_signalled(&mut stopped).await;
    }

    /// Deliveries from every subscription of this consumer.
    ///
    /// The buffer holds `message_buffer` messages; when it is full, subscriptions stop
    /// reading from the broker until there is room (or the consumer stops).
    pub fn messages(&self) -> EventStream<Message<T>> {
        self.inner.messages.clone()
    }

    /// Subscription failures.
    pub fn errors(&self) -> EventStream<ResourceError> {
        self.inner.error_stream.clone()
    }

    pub fn dropped_errors(&self) -> u64 {
        self.inner.errors.dropped()
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.lock()
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.settings.queue_name
    }

    /// Surfaced messages that have not been settled yet.
    pub fn outstanding_messages(&self) -> usize {
        self.inner.session.outstanding()
    }
}

/// Keep one subscription open until stop is signalled.
///
/// Returns the channel it was consuming on, if any, so that it can be retired once the
/// consumer is done draining.
#[tracing::instrument(name = "consumer_subscription", skip(shared, stop), fields(queue = %shared.settings.queue_name))]
async fn subscribe<T: Transport>(
    subscription: usize,
    shared: Arc<Shared<T>>,
    mut stop: watch::Receiver<bool>,
) -> Option<PooledChannel<T>> {
    loop {
        let acquired = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut stop) => return None,
            acquired = shared.channels.acquire() => acquired,
        };
        // Not raced against stop: a consumer registered on the channel must be cancelled by
        // `forward` before the channel can leave this task.
        let opened = match acquired {
            Ok(channel) => shared.open_subscription(channel).await,
            Err(e) => Err(e.into()),
        };
        match opened {
            Ok((channel, consumer_tag, deliveries)) => {
                debug!(consumer_tag, channel_id = channel.id(), "Subscription opened");
                if let Some(channel) = shared
                    .forward(channel, &consumer_tag, deliveries, &mut stop)
                    .await
                {
                    return Some(channel);
                }
            }
            Err(e) => {
                warn!("Failed to open a subscription: {e:#}");
                shared.errors.emit(ResourceError::new(
                    ResourceKind::Consumer,
                    None,
                    e.context(format!(
                        "Failed to subscribe to '{}'",
                        shared.settings.queue_name
                    )),
                ));
            }
        }

        tokio::select! {
            biased;
            _ = shutdown_signalled(&mut stop) => return None,
            _ = tokio::time::sleep(shared.settings.sleep_on_error()) => {}
        }
    }
}

impl<T: Transport> Shared<T> {
    fn consumer_tag(&self) -> String {
        let prefix = self
            .settings
            .consumer_name
            .as_deref()
            .unwrap_or(&self.settings.queue_name);
        format!("{prefix}-{}", Uuid::new_v4())
    }

    async fn open_subscription(
        &self,
        channel: PooledChannel<T>,
    ) -> Result<(PooledChannel<T>, String, DeliveryStream), anyhow::Error> {
        let consumer_tag = self.consumer_tag();
        let options = ConsumeOptions {
            no_ack: self.settings.auto_ack,
            exclusive: self.settings.exclusive,
            no_local: self.settings.no_local,
        };

        let subscribed = match channel.raw().qos(self.settings.prefetch_count).await {
            Ok(()) => {
                channel
                    .raw()
                    .consume(&self.settings.queue_name, &consumer_tag, options)
                    .await
            }
            Err(e) => Err(e),
        };

        match subscribed {
            Ok(deliveries) => Ok((channel, consumer_tag, deliveries)),
            Err(e) => {
                self.channels
                    .flag(channel, anyhow!("Failed to open a subscription: {e:#}"));
                Err(e)
            }
        }
    }

    /// Forward deliveries until the subscription breaks (`None`) or stop is signalled.
    async fn forward(
        &self,
        channel: PooledChannel<T>,
        consumer_tag: &str,
        mut deliveries: DeliveryStream,
        stop: &mut watch::Receiver<bool>,
    ) -> Option<PooledChannel<T>> {
        let handle = channel.handle();
        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut *stop) => break None,
                next = deliveries.next() => next,
            };
            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => break Some(e),
                None => break Some(anyhow!("The broker cancelled the subscription")),
            };

            let message = Message::new(
                delivery,
                Arc::clone(&handle),
                Arc::clone(&self.session),
                self.settings.auto_ack,
            );
            tokio::select! {
                biased;
                _ = shutdown_signalled(&mut *stop) => break None,
                _ = self.messages_tx.send(message) => {}
            }
        };

        let Some(failure) = failure else {
            if let Err(e) = channel.raw().cancel(consumer_tag).await {
                debug!(consumer_tag, "Failed to cancel the subscription: {e:#}");
            }
            return Some(channel);
        };

        warn!(
            consumer_tag,
            channel_id = channel.id(),
            "Subscription broke: {failure:#}"
        );
        self.errors.emit(ResourceError::new(
            ResourceKind::Consumer,
            Some(channel.id()),
            anyhow!("Subscription to '{}' broke: {failure:#}", self.settings.queue_name),
        ));
        self.channels.flag(channel, failure);
        None
    }
}

async fn finish<T: Transport>(shared: Arc<Shared<T>>, drain: bool) {
    let mut subscriptions = std::mem::take(&mut *shared.subscriptions.lock());
    let mut channels = Vec::new();
    while let Some(joined) = subscriptions.join_next().await {
        match joined {
            Ok(Some(channel)) => channels.push(channel),
            Ok(None) => {}
            Err(e) if e.is_panic() => error!("A consumer subscription panicked: {e}"),
            Err(_) => {}
        }
    }

    // Nobody has seen these yet: dropping them hands them back to the broker.
    let mut unread = 0usize;
    while shared.messages.try_recv().is_some() {
        unread += 1;
    }
    if unread > 0 {
        debug!(unread, "Discarded buffered messages");
    }

    if drain {
        let drain_timeout = shared.settings.drain_timeout();
        if tokio::time::timeout(drain_timeout, shared.session.all_settled())
            .await
            .is_err()
        {
            warn!(
                outstanding = shared.session.outstanding(),
                ?drain_timeout,
                "Consumer did not drain in time"
            );
        }
    }

    shared.session.orphan();
    for channel in channels {
        shared.channels.retire(channel);
    }
    *shared.state.lock() = ConsumerState::Stopped;
    shared.stopped.send_replace(true);
    debug!(queue = %shared.settings.queue_name, "Consumer stopped");
}
