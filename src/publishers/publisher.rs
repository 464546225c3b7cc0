use super::{Envelope, Letter, Notification, PublishError};
use crate::amqp::configuration::PublisherSettings;
use crate::amqp::transport::{BrokerChannel, Confirmation, Transport};
use crate::amqp::ConnectionFactory;
use crate::events::{EventSink, EventStream, ResourceError, ResourceKind};
use crate::pool::recovery::Backoff;
use crate::pool::{ChannelPool, PooledChannel};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Lifecycle of a [`Publisher`]: `Idle → Publishing → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// Letters can be queued but nothing is published yet.
    Idle,
    Publishing,
    /// Terminal. The publisher cannot be restarted.
    Stopped,
}

/// Errors returned synchronously by the [`Publisher`] API.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    /// Carries back the letters that were not accepted.
    #[error("The publisher is stopped and no longer accepts letters")]
    Stopped(Vec<Letter>),
    #[error("The publisher has been stopped and cannot be started again")]
    AlreadyStopped,
}

/// What the workers are asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Finish the letter at hand and whatever is still buffered.
    Draining,
    /// Abandon everything.
    Forced,
}

/// An auto-publishing pipeline on top of a [`ChannelPool`].
///
/// Letters are queued on an internal bounded buffer and published by a set of worker
/// tasks, each borrowing a channel per letter. Every letter accepted by
/// [`queue_letter`](Self::queue_letter) yields exactly one [`Notification`].
///
/// A publish that fails because its channel broke is retried on a fresh channel
/// (`Letter::retry_count` times, once by default). Refusals by the broker (nack, unroutable
/// message) are reported straight away.
///
/// ```rust,no_run
/// use carrot_stew::amqp::configuration::PublisherSettings;
/// use carrot_stew::pool::ChannelPool;
/// use carrot_stew::publishers::{Letter, Publisher};
///
/// async fn publish_all(channels: ChannelPool) -> anyhow::Result<()> {
///     let publisher = Publisher::new(channels, PublisherSettings::default());
///     let notifications = publisher.notifications();
///     publisher.start_auto_publish()?;
///
///     for i in 0..10 {
///         publisher
///             .queue_letter(Letter::new("", format!("Queue-{i}"), "hello"))
///             .await?;
///     }
///     for _ in 0..10 {
///         let notification = notifications.recv().await;
///         println!("{notification:?}");
///     }
///     publisher.stop_auto_publish().await;
///     Ok(())
/// }
/// ```
pub struct Publisher<T: Transport = ConnectionFactory> {
    inner: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Shared<T: Transport> {
    channels: ChannelPool<T>,
    settings: PublisherSettings,
    state: Mutex<PublisherState>,
    phase: watch::Sender<Phase>,
    letters_tx: mpsc::Sender<Letter>,
    letters_rx: tokio::sync::Mutex<mpsc::Receiver<Letter>>,
    notifications_tx: mpsc::Sender<Notification>,
    notifications: EventStream<Notification>,
    evicted: AtomicU64,
    errors: EventSink<ResourceError>,
    error_stream: EventStream<ResourceError>,
    workers: Mutex<JoinSet<()>>,
}

impl<T: Transport> Publisher<T> {
    /// A new publisher, in the [`Idle`](PublisherState::Idle) state.
    pub fn new(channels: ChannelPool<T>, settings: PublisherSettings) -> Self {
        let (letters_tx, letters_rx) = mpsc::channel(settings.letter_buffer.max(1));
        let (notifications_tx, notifications_rx) =
            mpsc::channel(settings.notification_buffer.max(1));
        let (errors, error_stream) = EventSink::new(settings.error_buffer);
        let (phase, _) = watch::channel(Phase::Running);

        Self {
            inner: Arc::new(Shared {
                channels,
                settings,
                state: Mutex::new(PublisherState::Idle),
                phase,
                letters_tx,
                letters_rx: tokio::sync::Mutex::new(letters_rx),
                notifications_tx,
                notifications: EventStream::from_receiver(notifications_rx),
                evicted: AtomicU64::new(0),
                errors,
                error_stream,
                workers: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Spawn the publishing workers.
    ///
    /// Starting a publisher that is already publishing does nothing.
    pub fn start_auto_publish(&self) -> Result<(), PublisherError> {
        let mut state = self.inner.state.lock();
        match *state {
            PublisherState::Publishing => return Ok(()),
            PublisherState::Stopped => return Err(PublisherError::AlreadyStopped),
            PublisherState::Idle => {}
        }
        *state = PublisherState::Publishing;

        let mut workers = self.inner.workers.lock();
        for worker in 0..self.inner.settings.workers.max(1) {
            workers.spawn(work(
                worker,
                Arc::clone(&self.inner),
                self.inner.phase.subscribe(),
            ));
        }
        debug!(
            workers = self.inner.settings.workers.max(1),
            "Publisher started"
        );
        Ok(())
    }

    /// Stop publishing.
    ///
    /// New letters are rejected straight away. Workers keep draining the buffer for up to
    /// `stop_timeout`, then whatever is in flight or still buffered is failed with
    /// [`PublishError::Stopped`]. Every accepted letter has been notified once this returns.
    ///
    /// Calling it more than once is a no-op.
    #[tracing::instrument(name = "publisher_stop", skip(self))]
    pub async fn stop_auto_publish(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == PublisherState::Stopped {
                return;
            }
            *state = PublisherState::Stopped;
        }

        self.inner.phase.send_replace(Phase::Draining);
        let mut workers = std::mem::take(&mut *self.inner.workers.lock());
        let stop_timeout = self.inner.settings.stop_timeout();
        if tokio::time::timeout(stop_timeout, join_all(&mut workers))
            .await
            .is_err()
        {
            warn!(?stop_timeout, "Publisher did not drain in time, forcing it");
        }
        self.inner.phase.send_replace(Phase::Forced);
        join_all(&mut workers).await;

        let mut letters = self.inner.letters_rx.lock().await;
        letters.close();
        let mut abandoned = 0u64;
        let mut stalled = false;
        while let Some(letter) = letters.recv().await {
            abandoned += 1;
            let notification = Notification {
                letter_id: letter.id,
                error: Some(PublishError::Stopped),
                attempts: 0,
            };
            // Once a send has timed out, nobody is reading: the rest are evicted without waiting.
            if stalled {
                self.inner.notify_now(notification);
            } else {
                stalled = !self.inner.notify(notification).await;
            }
        }
        debug!(abandoned, "Publisher stopped");
    }

    /// Queue a letter for publishing.
    ///
    /// Waits for room when the buffer is full. Letters can be queued before the publisher
    /// is started; they are published once it is.
    pub async fn queue_letter(&self, letter: Letter) -> Result<(), PublisherError> {
        if self.state() == PublisherState::Stopped {
            return Err(PublisherError::Stopped(vec![letter]));
        }
        let mut phase = self.inner.phase.subscribe();
        let permit = tokio::select! {
            permit = self.inner.letters_tx.reserve() => permit,
            _ = stopping(&mut phase) => return Err(PublisherError::Stopped(vec![letter])),
        };
        let Ok(permit) = permit else {
            return Err(PublisherError::Stopped(vec![letter]));
        };

        // Stop waits for every letter sent before it flipped the state.
        let state = self.inner.state.lock();
        if *state == PublisherState::Stopped {
            return Err(PublisherError::Stopped(vec![letter]));
        }
        permit.send(letter);
        Ok(())
    }

    /// Queue letters in order, with the same backpressure as [`queue_letter`](Self::queue_letter).
    ///
    /// If the publisher stops midway, the error carries every letter that was not accepted.
    pub async fn queue_letters(
        &self,
        letters: impl IntoIterator<Item = Letter>,
    ) -> Result<(), PublisherError> {
        let mut letters = letters.into_iter();
        while let Some(letter) = letters.next() {
            match self.queue_letter(letter).await {
                Ok(()) => {}
                Err(PublisherError::Stopped(mut rejected)) => {
                    rejected.extend(letters);
                    return Err(PublisherError::Stopped(rejected));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Publish a single letter right away, bypassing the buffer.
    ///
    /// Same retry policy as the workers, but no notification is emitted: the outcome is
    /// the return value.
    pub async fn publish(&self, letter: Letter) -> Result<(), PublishError> {
        if self.state() == PublisherState::Stopped {
            return Err(PublishError::Stopped);
        }
        let mut attempts = 0;
        self.inner.deliver(&letter, &mut attempts).await
    }

    /// The terminal outcome of every queued letter.
    ///
    /// When nobody reads it, a worker waits up to `notification_timeout` for room before
    /// evicting the notification. Evictions are logged, counted
    /// ([`evicted_notifications`](Self::evicted_notifications)) and reported on
    /// [`errors`](Self::errors).
    pub fn notifications(&self) -> EventStream<Notification> {
        self.inner.notifications.clone()
    }

    /// Errors of the pipeline itself. Channel and connection errors are on the
    /// [`ChannelPool`]'s stream.
    pub fn errors(&self) -> EventStream<ResourceError> {
        self.inner.error_stream.clone()
    }

    pub fn dropped_errors(&self) -> u64 {
        self.inner.errors.dropped()
    }

    pub fn evicted_notifications(&self) -> u64 {
        self.inner.evicted.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> PublisherState {
        *self.inner.state.lock()
    }
}

#[tracing::instrument(name = "publisher_worker", skip(shared, phase))]
async fn work<T: Transport>(worker: usize, shared: Arc<Shared<T>>, mut phase: watch::Receiver<Phase>) {
    while let Some(letter) = shared.next_letter(&mut phase).await {
        let mut attempts = 0;
        let outcome = tokio::select! {
            outcome = shared.deliver(&letter, &mut attempts) => outcome,
            _ = forced(&mut phase) => Err(PublishError::Stopped),
        };
        if let Err(e) = &outcome {
            debug!(letter_id = letter.id, attempts, "Failed to publish letter: {e}");
        }
        shared
            .notify(Notification {
                letter_id: letter.id,
                error: outcome.err(),
                attempts,
            })
            .await;
    }
}

impl<T: Transport> Shared<T> {
    /// The next letter to publish, or `None` once the worker should exit.
    async fn next_letter(&self, phase: &mut watch::Receiver<Phase>) -> Option<Letter> {
        loop {
            let current = *phase.borrow_and_update();
            match current {
                Phase::Forced => return None,
                Phase::Draining => return self.letters_rx.lock().await.try_recv().ok(),
                Phase::Running => {
                    let mut letters = tokio::select! {
                        letters = self.letters_rx.lock() => letters,
                        _ = phase.changed() => continue,
                    };
                    tokio::select! {
                        letter = letters.recv() => return letter,
                        _ = phase.changed() => continue,
                    }
                }
            }
        }
    }

    async fn deliver(&self, letter: &Letter, attempts: &mut u32) -> Result<(), PublishError> {
        let envelope = letter.stamped_envelope();
        let mut retries_left = letter.retry_count;
        loop {
            let channel = self.acquire_channel().await?;
            *attempts += 1;
            match self.publish_once(channel, &envelope, &letter.body).await {
                Err(PublishError::ChannelFailure(e)) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        letter_id = letter.id,
                        "Channel failed while publishing, retrying on a fresh one: {e:#}"
                    );
                }
                outcome => return outcome,
            }
        }
    }

    async fn acquire_channel(&self) -> Result<PooledChannel<T>, PublishError> {
        let mut backoff = Backoff::new(&self.channels.settings().backoff);
        let max_attempts = self.settings.acquire_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.channels.acquire().await {
                Ok(channel) => return Ok(channel),
                Err(source) if source.is_terminal() || attempts >= max_attempts => {
                    self.errors.emit(ResourceError::new(
                        ResourceKind::Publisher,
                        None,
                        anyhow!("No channel available after {attempts} attempts: {source}"),
                    ));
                    return Err(PublishError::ChannelUnavailable { attempts, source });
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    debug!(attempts, ?delay, "Failed to acquire a channel: {e}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// A single publish on `channel`, which is released or flagged depending on the outcome.
    #[tracing::instrument(
        name = "publish",
        skip_all,
        fields(channel_id = channel.id(), exchange = %envelope.exchange, routing_key = %envelope.routing_key)
    )]
    async fn publish_once(
        &self,
        channel: PooledChannel<T>,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), PublishError> {
        let publish_timeout = self.settings.publish_timeout();
        let confirmation =
            match tokio::time::timeout(publish_timeout, channel.raw().publish(envelope, body)).await
            {
                Ok(Ok(confirmation)) => confirmation,
                Ok(Err(e)) => {
                    self.channels
                        .flag(channel, anyhow!("Publish failed: {e:#}"));
                    return Err(PublishError::ChannelFailure(e));
                }
                Err(_) => {
                    self.channels.flag(
                        channel,
                        anyhow!("Publish was not confirmed within {publish_timeout:?}"),
                    );
                    return Err(PublishError::Timeout(publish_timeout));
                }
            };
        self.channels.release(channel);

        match confirmation {
            Confirmation::Ack | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack => Err(PublishError::Nacked),
            Confirmation::Returned {
                reply_code,
                reply_text,
            } => Err(PublishError::Unroutable {
                reply_code,
                reply_text,
            }),
        }
    }

    /// Returns `false` if the notification had to be evicted.
    async fn notify(&self, notification: Notification) -> bool {
        let timeout = self.settings.notification_timeout();
        match self.notifications_tx.send_timeout(notification, timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(notification)) => {
                self.evict(notification);
                false
            }
            // The receiving side lives as long as the publisher.
            Err(SendTimeoutError::Closed(_)) => true,
        }
    }

    fn notify_now(&self, notification: Notification) {
        if let Err(TrySendError::Full(notification)) = self.notifications_tx.try_send(notification)
        {
            self.evict(notification);
        }
    }

    fn evict(&self, notification: Notification) {
        let evicted = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(evicted, "Notification stream is full, evicting: {notification}");
        self.errors.emit(ResourceError::new(
            ResourceKind::Publisher,
            None,
            anyhow!("Evicted notification for letter {}", notification.letter_id),
        ));
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("A publisher worker panicked: {e}");
            }
        }
    }
}

/// Resolves once stop has been requested.
async fn stopping(phase: &mut watch::Receiver<Phase>) {
    loop {
        if *phase.borrow_and_update() != Phase::Running {
            return;
        }
        if phase.changed().await.is_err() {
            return;
        }
    }
}

async fn forced(phase: &mut watch::Receiver<Phase>) {
    loop {
        if *phase.borrow() == Phase::Forced {
            return;
        }
        if phase.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::configuration::{BackoffSettings, PoolSettings};
    use crate::amqp::InMemoryBroker;
    use crate::pool::ConnectionPool;
    use crate::publishers::LetterId;
    use crate::topology::QueueDescriptor;
    use std::collections::HashSet;
    use std::time::Duration;

    fn pool_settings() -> PoolSettings {
        PoolSettings {
            max_connections: 2,
            max_channels_per_connection: 4,
            max_channels: 8,
            health_check_interval_ms: 20,
            acquire_timeout_ms: 300,
            backoff: BackoffSettings {
                initial_delay_ms: 10,
                max_delay_ms: 50,
                retry_ceiling: 3,
            },
            ..PoolSettings::default()
        }
    }

    async fn channels(broker: &InMemoryBroker) -> ChannelPool<InMemoryBroker> {
        let connections = ConnectionPool::new(broker.clone(), pool_settings())
            .await
            .unwrap();
        let channels = ChannelPool::new(connections, pool_settings()).await.unwrap();
        let channel = channels.acquire().await.unwrap();
        channel
            .raw()
            .declare_queue(&QueueDescriptor::new("jobs"))
            .await
            .unwrap();
        channels
    }

    async fn collect(
        notifications: &EventStream<Notification>,
        count: usize,
    ) -> Vec<Notification> {
        let mut collected = Vec::with_capacity(count);
        while collected.len() < count {
            let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
                .await
                .expect("timed out waiting for notifications")
                .expect("notification stream closed");
            collected.push(notification);
        }
        collected
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_queued_letter_gets_one_notification() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(channels(&broker).await, PublisherSettings::default());
        let notifications = publisher.notifications();

        let letters: Vec<Letter> = (0..200).map(|_| Letter::new("", "jobs", "body")).collect();
        let ids: HashSet<LetterId> = letters.iter().map(|letter| letter.id).collect();
        publisher.queue_letters(letters).await.unwrap();
        publisher.start_auto_publish().unwrap();

        let notified = collect(&notifications, 200).await;
        assert!(notified.iter().all(Notification::success));
        let notified_ids: HashSet<LetterId> =
            notified.iter().map(|notification| notification.letter_id).collect();
        assert_eq!(notified_ids, ids);
        assert_eq!(broker.message_count("jobs"), 200);

        publisher.stop_auto_publish().await;
        assert!(notifications.try_recv().is_none());
    }

    #[tokio::test]
    async fn broken_channels_are_retried_once_on_a_fresh_channel() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(channels(&broker).await, PublisherSettings::default());

        broker.fail_next_publishes(1);
        publisher.publish(Letter::new("", "jobs", "a")).await.unwrap();
        assert_eq!(broker.message_count("jobs"), 1);

        broker.fail_next_publishes(2);
        let outcome = publisher.publish(Letter::new("", "jobs", "b")).await;
        assert!(matches!(outcome, Err(PublishError::ChannelFailure(_))));

        broker.fail_next_publishes(1);
        let outcome = publisher
            .publish(Letter::new("", "jobs", "c").with_retry_count(0))
            .await;
        assert!(matches!(outcome, Err(PublishError::ChannelFailure(_))));
    }

    #[tokio::test]
    async fn broker_refusals_are_not_retried() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(channels(&broker).await, PublisherSettings::default());
        let notifications = publisher.notifications();
        publisher.start_auto_publish().unwrap();

        broker.nack_next_publishes(1);
        publisher
            .queue_letter(Letter::new("", "jobs", "nacked").with_id(1))
            .await
            .unwrap();
        let nacked = collect(&notifications, 1).await.remove(0);
        assert_eq!(nacked.letter_id, 1);
        assert_eq!(nacked.attempts, 1);
        assert!(matches!(nacked.error, Some(PublishError::Nacked)));

        let unroutable = Letter::new("", "nowhere", "lost")
            .with_id(2)
            .with_envelope(Envelope::new("", "nowhere").with_mandatory(true));
        publisher.queue_letter(unroutable).await.unwrap();
        let returned = collect(&notifications, 1).await.remove(0);
        assert_eq!(returned.attempts, 1);
        assert!(matches!(
            returned.error,
            Some(PublishError::Unroutable { reply_code: 312, .. })
        ));

        publisher.stop_auto_publish().await;
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(channels(&broker).await, PublisherSettings::default());
        assert_eq!(publisher.state(), PublisherState::Idle);

        publisher.start_auto_publish().unwrap();
        publisher.start_auto_publish().unwrap();
        assert_eq!(publisher.state(), PublisherState::Publishing);

        publisher.stop_auto_publish().await;
        publisher.stop_auto_publish().await;
        assert_eq!(publisher.state(), PublisherState::Stopped);

        assert!(matches!(
            publisher.start_auto_publish(),
            Err(PublisherError::AlreadyStopped)
        ));
        let rejected = publisher
            .queue_letters(vec![Letter::new("", "jobs", "a"), Letter::new("", "jobs", "b")])
            .await;
        assert!(matches!(rejected, Err(PublisherError::Stopped(letters)) if letters.len() == 2));
        assert!(matches!(
            publisher.publish(Letter::new("", "jobs", "c")).await,
            Err(PublishError::Stopped)
        ));
    }

    #[tokio::test]
    async fn stopping_an_idle_publisher_fails_buffered_letters() {
        let broker = InMemoryBroker::new();
        let publisher = Publisher::new(channels(&broker).await, PublisherSettings::default());
        let notifications = publisher.notifications();

        publisher
            .queue_letter(Letter::new("", "jobs", "never sent").with_id(7))
            .await
            .unwrap();
        publisher.stop_auto_publish().await;

        let notification = collect(&notifications, 1).await.remove(0);
        assert_eq!(notification.letter_id, 7);
        assert_eq!(notification.attempts, 0);
        assert!(matches!(notification.error, Some(PublishError::Stopped)));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn unread_notifications_are_evicted_instead_of_blocking() {
        let broker = InMemoryBroker::new();
        let settings = PublisherSettings {
            workers: 1,
            notification_buffer: 1,
            notification_timeout_ms: 10,
            ..PublisherSettings::default()
        };
        let publisher = Publisher::new(channels(&broker).await, settings);
        let errors = publisher.errors();
        publisher.start_auto_publish().unwrap();

        publisher
            .queue_letters((0..3).map(|_| Letter::new("", "jobs", "x")))
            .await
            .unwrap();
        publisher.stop_auto_publish().await;

        assert_eq!(broker.message_count("jobs"), 3);
        assert_eq!(publisher.evicted_notifications(), 2);
        assert_eq!(errors.recv().await.unwrap().kind, ResourceKind::Publisher);
    }

    #[tokio::test]
    async fn stopping_with_an_unread_stream_waits_for_one_timeout_at_most() {
        let broker = InMemoryBroker::new();
        let settings = PublisherSettings {
            notification_buffer: 1,
            notification_timeout_ms: 200,
            ..PublisherSettings::default()
        };
        let publisher = Publisher::new(channels(&broker).await, settings);
        publisher
            .queue_letters((0..10).map(|_| Letter::new("", "jobs", "x")))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        publisher.stop_auto_publish().await;

        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_eq!(publisher.evicted_notifications(), 9);
    }
}
