//! A self-healing pool of protocol channels, multiplexed over the connections of a
//! [`ConnectionPool`].
use super::connection::{ConnectionHandle, ConnectionPool, PooledConnection};
use super::error::{from_pool_error, Error};
use super::recovery::{supervise, PooledResource, Registry, Report, Supervised};
use super::{timeouts, PoolStatus, ERROR_BUFFER};
use crate::amqp::configuration::{BackoffSettings, PoolSettings};
use crate::amqp::transport::{BrokerChannel, BrokerConnection, ChannelOf, Transport};
use crate::amqp::ConnectionFactory;
use crate::events::{EventSink, EventStream, ResourceError, ResourceKind};
use anyhow::Context;
use deadpool::managed::{self, Manager, Object};
use deadpool::Runtime;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

type ConnectionOf<T> = ConnectionHandle<<T as Transport>::Connection>;

/// A connection borrowed from the [`ConnectionPool`] to host channels.
struct Host<T: Transport> {
    connection: PooledConnection<T>,
    channels: Arc<AtomicUsize>,
}

/// Keeps a slot open on a host for as long as the channel using it is alive.
struct HostLease {
    channels: Arc<AtomicUsize>,
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.channels.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A live protocol channel owned by a [`ChannelPool`].
pub struct ChannelHandle<T: Transport> {
    id: u64,
    channel: ChannelOf<T>,
    connection: Arc<ConnectionOf<T>>,
    ack_mode: bool,
    flagged: AtomicBool,
    _lease: HostLease,
}

impl<T: Transport> ChannelHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get access to the underlying channel.
    pub fn raw(&self) -> &ChannelOf<T> {
        &self.channel
    }

    /// The id of the pooled connection hosting this channel.
    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    /// Whether the channel is in publisher-confirms mode.
    pub fn ack_mode(&self) -> bool {
        self.ack_mode
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_flagged() && self.is_alive()
    }

    fn is_alive(&self) -> bool {
        self.channel.is_open() && self.connection.raw().is_connected()
    }
}

impl<T: Transport> fmt::Debug for ChannelHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("connection_id", &self.connection.id())
            .field("ack_mode", &self.ack_mode)
            .field("flagged", &self.flagged)
            .finish()
    }
}

#[async_trait::async_trait]
impl<T: Transport> PooledResource for ChannelHandle<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_flagged(&self) -> bool {
        ChannelHandle::is_flagged(self)
    }

    fn mark_flagged(&self) -> bool {
        !self.flagged.swap(true, Ordering::SeqCst)
    }

    fn is_alive(&self) -> bool {
        ChannelHandle::is_alive(self)
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            debug!(channel_id = self.id, "Failed to close channel: {e:#}");
        }
    }
}

/// `ChannelManager` implements [`Manager`] to open channels on connections borrowed from a
/// [`ConnectionPool`].
///
/// Connections are reused across channels, up to `max_channels_per_connection` each.
pub struct ChannelManager<T: Transport> {
    connections: ConnectionPool<T>,
    hosts: Arc<Mutex<Vec<Host<T>>>>,
    max_channels_per_connection: usize,
    ack_mode: bool,
    next_id: AtomicU64,
    registry: Arc<Registry<ChannelHandle<T>>>,
    reports: mpsc::UnboundedSender<Report<ChannelHandle<T>>>,
}

impl<T: Transport> ChannelManager<T> {
    /// Take a slot on an existing healthy host, if any has room.
    fn reserve_host(&self) -> Option<(Arc<ConnectionOf<T>>, HostLease)> {
        let mut hosts = self.hosts.lock();
        // Hosts without channels go back to the connection pool.
        hosts.retain(|host| host.channels.load(Ordering::SeqCst) > 0);
        hosts
            .iter()
            .find(|host| {
                host.connection.is_healthy()
                    && host.channels.load(Ordering::SeqCst) < self.max_channels_per_connection
            })
            .map(|host| {
                host.channels.fetch_add(1, Ordering::SeqCst);
                (
                    host.connection.handle(),
                    HostLease {
                        channels: Arc::clone(&host.channels),
                    },
                )
            })
    }

    async fn host(&self) -> Result<(Arc<ConnectionOf<T>>, HostLease), Error> {
        if let Some(host) = self.reserve_host() {
            return Ok(host);
        }
        // Every host is full or broken: borrow another connection, outside the lock.
        let connection = self.connections.acquire().await?;
        let handle = connection.handle();
        let channels = Arc::new(AtomicUsize::new(1));
        self.hosts.lock().push(Host {
            connection,
            channels: Arc::clone(&channels),
        });
        debug!(connection_id = handle.id(), "Hosting channels on a new connection");
        Ok((handle, HostLease { channels }))
    }
}

#[async_trait::async_trait]
impl<T: Transport> Manager for ChannelManager<T> {
    type Type = Arc<ChannelHandle<T>>;
    type Error = Error;

    #[tracing::instrument(name = "rabbitmq_pool_open_channel", skip(self))]
    async fn create(&self) -> Result<Arc<ChannelHandle<T>>, Error> {
        let (connection, lease) = self.host().await?;
        let channel = connection
            .raw()
            .open_channel()
            .await
            .with_context(|| format!("Failed to open a channel on connection {}", connection.id()))?;
        if self.ack_mode {
            // A channel is only handed out once its mode matches the configuration.
            if let Err(e) = channel.enable_confirms().await {
                let _ = channel.close().await;
                return Err(e.context("Failed to enable publisher confirms").into());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reports = self.reports.clone();
        channel.on_error(Box::new(move |error| {
            let _ = reports.send(Report::Broken { id, error });
        }));

        let handle = Arc::new(ChannelHandle {
            id,
            channel,
            connection,
            ack_mode: self.ack_mode,
            flagged: AtomicBool::new(false),
            _lease: lease,
        });
        self.registry.register(&handle);
        debug!(
            channel_id = id,
            connection_id = handle.connection_id(),
            "Opened a new channel"
        );
        Ok(handle)
    }

    async fn recycle(&self, obj: &mut Arc<ChannelHandle<T>>) -> managed::RecycleResult<Error> {
        if obj.is_healthy() {
            Ok(())
        } else {
            Err(managed::RecycleError::Message(format!(
                "Channel {} is not in an healthy state",
                obj.id
            )))
        }
    }
}

/// A channel lent out by a [`ChannelPool`].
///
/// Dropping it (or passing it to [`ChannelPool::release`]) hands it back to the pool.
pub struct PooledChannel<T: Transport = ConnectionFactory> {
    object: Object<ChannelManager<T>>,
}

impl<T: Transport> PooledChannel<T> {
    /// A shared reference to the channel, e.g. to acknowledge deliveries after it has been
    /// handed back.
    pub fn handle(&self) -> Arc<ChannelHandle<T>> {
        Arc::clone(&self.object)
    }
}

impl<T: Transport> Deref for PooledChannel<T> {
    type Target = ChannelHandle<T>;

    fn deref(&self) -> &ChannelHandle<T> {
        &self.object
    }
}

/// `ChannelPool` keeps a bounded set of protocol channels open on top of a
/// [`ConnectionPool`].
///
/// Channels are opened lazily, up to `max_channels_per_connection` on each borrowed
/// connection; once every hosting connection is full, another one is borrowed. With
/// `ack_mode` set, every channel is put in publisher-confirms mode before it is lent out.
///
/// A broken channel (signalled by the protocol or [`flag`](Self::flag)ged by its borrower)
/// is discarded and replaced in the background. Channel breakage never flags the hosting
/// connection: the [`ConnectionPool`] relies on the connection's own signal for that.
///
/// Cloning a `ChannelPool` is cheap: clones share the same channels.
pub struct ChannelPool<T: Transport = ConnectionFactory> {
    inner: Arc<Shared<T>>,
}

impl<T: Transport> Clone for ChannelPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Shared<T: Transport> {
    pool: managed::Pool<ChannelManager<T>>,
    connections: ConnectionPool<T>,
    hosts: Arc<Mutex<Vec<Host<T>>>>,
    registry: Arc<Registry<ChannelHandle<T>>>,
    reports: mpsc::UnboundedSender<Report<ChannelHandle<T>>>,
    errors: EventSink<ResourceError>,
    error_stream: EventStream<ResourceError>,
    settings: PoolSettings,
    shutdown: watch::Sender<bool>,
}

#[async_trait::async_trait]
impl<T: Transport> Supervised for Shared<T> {
    type Resource = ChannelHandle<T>;

    const KIND: ResourceKind = ResourceKind::Channel;

    fn registry(&self) -> &Registry<ChannelHandle<T>> {
        &self.registry
    }

    fn errors(&self) -> &EventSink<ResourceError> {
        &self.errors
    }

    fn backoff(&self) -> &BackoffSettings {
        &self.settings.backoff
    }

    fn needs_replenishing(&self) -> bool {
        self.registry.healthy_count() < self.settings.min_channels
    }

    async fn top_up(&self) -> Result<(), Error> {
        let mut held = Vec::new();
        while self.needs_replenishing() && held.len() < self.settings.max_channels {
            let channel = self
                .pool
                .get()
                .await
                .map_err(|e| from_pool_error(e, self.settings.acquire_timeout()))?;
            held.push(channel);
        }
        Ok(())
    }
}

impl<T: Transport> ChannelPool<T> {
    /// Build a channel pool on top of `connections`, opening `settings.min_channels`
    /// channels upfront.
    #[tracing::instrument(name = "channel_pool_new", skip_all)]
    pub async fn new(connections: ConnectionPool<T>, settings: PoolSettings) -> Result<Self, Error> {
        settings.validate().map_err(Error::Configuration)?;

        let registry = Arc::new(Registry::default());
        let hosts = Arc::new(Mutex::new(Vec::new()));
        let (reports, reports_receiver) = mpsc::unbounded_channel();
        let manager = ChannelManager {
            connections: connections.clone(),
            hosts: Arc::clone(&hosts),
            max_channels_per_connection: settings.max_channels_per_connection,
            ack_mode: settings.ack_mode,
            next_id: AtomicU64::new(1),
            registry: Arc::clone(&registry),
            reports: reports.clone(),
        };
        let pool = managed::Pool::builder(manager)
            .max_size(settings.max_channels)
            .timeouts(timeouts(settings.acquire_timeout()))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let mut initial = Vec::with_capacity(settings.min_channels);
        for _ in 0..settings.min_channels {
            initial.push(
                pool.get()
                    .await
                    .map_err(|e| from_pool_error(e, settings.acquire_timeout()))?,
            );
        }
        drop(initial);

        let (errors, error_stream) = EventSink::new(ERROR_BUFFER);
        // A single stream for both failure classes: connection errors keep their own tag.
        connections.forward_errors_to(errors.sender());

        let (shutdown, shutdown_receiver) = watch::channel(false);
        let health_check_interval = settings.health_check_interval();
        let inner = Arc::new(Shared {
            pool,
            connections,
            hosts,
            registry,
            reports,
            errors,
            error_stream,
            settings,
            shutdown,
        });
        tokio::spawn(supervise(
            Arc::downgrade(&inner),
            reports_receiver,
            shutdown_receiver,
            health_check_interval,
        ));
        debug!(
            min_channels = inner.settings.min_channels,
            max_channels = inner.settings.max_channels,
            ack_mode = inner.settings.ack_mode,
            "Channel pool ready"
        );
        Ok(Self { inner })
    }

    /// Get a healthy channel, exclusively.
    ///
    /// Waits up to `acquire_timeout` if every channel is lent out and the pool is at
    /// capacity (or no connection can be borrowed to host a new one).
    pub async fn acquire(&self) -> Result<PooledChannel<T>, Error> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let object = self
            .inner
            .pool
            .get()
            .await
            .map_err(|e| from_pool_error(e, self.inner.settings.acquire_timeout()))?;
        Ok(PooledChannel { object })
    }

    /// Hand a channel back to the idle set. Equivalent to dropping it.
    pub fn release(&self, channel: PooledChannel<T>) {
        drop(channel);
    }

    /// Mark a channel as broken: it is discarded, reported on [`errors`](Self::errors) and
    /// replaced in the background.
    pub fn flag(&self, channel: PooledChannel<T>, reason: anyhow::Error) {
        self.detach(channel, Some(reason));
    }

    /// Discard a healthy channel without reporting an error, e.g. to make the broker
    /// redeliver whatever was left unacknowledged on it.
    pub fn retire(&self, channel: PooledChannel<T>) {
        self.detach(channel, None);
    }

    fn detach(&self, channel: PooledChannel<T>, reason: Option<anyhow::Error>) {
        let handle = Object::take(channel.object);
        // Already reported if the protocol signalled it first.
        let reason = reason.filter(|_| handle.mark_flagged());
        let _ = self.inner.reports.send(Report::Flagged { handle, reason });
    }

    /// Errors about channels of this pool, and about the connections hosting them.
    ///
    /// Each error is tagged with the kind and id of the resource that failed. Like
    /// [`ConnectionPool::errors`], the stream is bounded and drops (and counts) errors
    /// when nobody reads it.
    pub fn errors(&self) -> EventStream<ResourceError> {
        self.inner.error_stream.clone()
    }

    pub fn dropped_errors(&self) -> u64 {
        self.inner.errors.dropped()
    }

    /// Whether channels are put in publisher-confirms mode.
    pub fn ack_mode(&self) -> bool {
        self.inner.settings.ack_mode
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn connections(&self) -> &ConnectionPool<T> {
        &self.inner.connections
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.inner.pool.status();
        PoolStatus {
            size: status.size,
            max_size: status.max_size,
            healthy: self.inner.registry.healthy_count(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Close every channel, hand the hosting connections back and stop the supervisor.
    ///
    /// The [`ConnectionPool`] itself keeps running: it may be shared with other pools.
    /// Calling it more than once is a no-op.
    #[tracing::instrument(name = "channel_pool_shutdown", skip(self))]
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.pool.close();
        for handle in self.inner.registry.live() {
            handle.mark_flagged();
            handle.close().await;
        }
        let hosts = std::mem::take(&mut *self.inner.hosts.lock());
        drop(hosts);
        debug!("Channel pool shut down");
    }
}
