//! A self-healing pool of broker connections, built on [`deadpool`].
use super::error::{from_pool_error, Error};
use super::recovery::{supervise, PooledResource, Registry, Report, Supervised};
use super::{timeouts, PoolStatus, ERROR_BUFFER};
use crate::amqp::configuration::{BackoffSettings, PoolSettings};
use crate::amqp::transport::{BrokerConnection, Transport};
use crate::amqp::ConnectionFactory;
use crate::events::{EventSink, EventStream, ResourceError, ResourceKind};
use deadpool::managed::{self, Manager, Object};
use deadpool::Runtime;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// A live broker connection owned by a [`ConnectionPool`].
///
/// Channels opened on the connection keep an `Arc` to it, but only the pool decides when it
/// is discarded.
pub struct ConnectionHandle<C> {
    id: u64,
    connection: C,
    flagged: AtomicBool,
}

impl<C: BrokerConnection> ConnectionHandle<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get access to the underlying connection.
    pub fn raw(&self) -> &C {
        &self.connection
    }

    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_flagged() && self.connection.is_connected()
    }
}

impl<C> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("flagged", &self.flagged)
            .finish()
    }
}

#[async_trait::async_trait]
impl<C: BrokerConnection> PooledResource for ConnectionHandle<C> {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_flagged(&self) -> bool {
        ConnectionHandle::is_flagged(self)
    }

    fn mark_flagged(&self) -> bool {
        !self.flagged.swap(true, Ordering::SeqCst)
    }

    fn is_alive(&self) -> bool {
        self.connection.is_connected()
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            debug!(connection_id = self.id, "Failed to close connection: {e:#}");
        }
    }
}

type Handle<T> = ConnectionHandle<<T as Transport>::Connection>;

/// `ConnectionManager` implements [`Manager`] to create and health-check the connections
/// of a [`ConnectionPool`].
pub struct ConnectionManager<T: Transport> {
    transport: T,
    next_id: AtomicU64,
    registry: Arc<Registry<Handle<T>>>,
    reports: mpsc::UnboundedSender<Report<Handle<T>>>,
}

#[async_trait::async_trait]
impl<T: Transport> Manager for ConnectionManager<T> {
    type Type = Arc<Handle<T>>;
    type Error = Error;

    #[tracing::instrument(name = "rabbitmq_pool_connect", skip(self))]
    async fn create(&self) -> Result<Arc<Handle<T>>, Error> {
        let connection = self.transport.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Register a callback to detect broken connections.
        let reports = self.reports.clone();
        connection.on_error(Box::new(move |error| {
            let _ = reports.send(Report::Broken { id, error });
        }));

        let handle = Arc::new(ConnectionHandle {
            id,
            connection,
            flagged: AtomicBool::new(false),
        });
        self.registry.register(&handle);
        debug!(connection_id = id, "Opened a new connection");
        Ok(handle)
    }

    async fn recycle(&self, obj: &mut Arc<Handle<T>>) -> managed::RecycleResult<Error> {
        if obj.is_healthy() {
            Ok(())
        } else {
            Err(managed::RecycleError::Message(format!(
                "Connection {} is not in an healthy state",
                obj.id
            )))
        }
    }
}

/// A connection lent out by a [`ConnectionPool`].
///
/// Dropping it (or passing it to [`ConnectionPool::release`]) hands it back to the pool.
pub struct PooledConnection<T: Transport = ConnectionFactory> {
    object: Object<ConnectionManager<T>>,
}

impl<T: Transport> PooledConnection<T> {
    /// A shared reference to the connection, e.g. to keep it alive from a channel.
    pub fn handle(&self) -> Arc<Handle<T>> {
        Arc::clone(&self.object)
    }
}

impl<T: Transport> Deref for PooledConnection<T> {
    type Target = Handle<T>;

    fn deref(&self) -> &Handle<T> {
        &self.object
    }
}

/// `ConnectionPool` keeps a bounded set of live broker connections.
///
/// - At least `min_connections` are dialled when the pool is built.
/// - Connections are lent out exclusively via [`acquire`](Self::acquire).
/// - Broken connections (detected by the protocol's error signal, the periodic health check,
///   or [`flag`](Self::flag)) are discarded and replaced in the background with capped
///   exponential backoff, and reported on [`errors`](Self::errors).
///
/// Cloning a `ConnectionPool` is cheap: clones share the same connections.
pub struct ConnectionPool<T: Transport = ConnectionFactory> {
    inner: Arc<Shared<T>>,
}

impl<T: Transport> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Shared<T: Transport> {
    pool: managed::Pool<ConnectionManager<T>>,
    registry: Arc<Registry<Handle<T>>>,
    reports: mpsc::UnboundedSender<Report<Handle<T>>>,
    errors: EventSink<ResourceError>,
    error_stream: EventStream<ResourceError>,
    settings: PoolSettings,
    shutdown: watch::Sender<bool>,
}

#[async_trait::async_trait]
impl<T: Transport> Supervised for Shared<T> {
    type Resource = Handle<T>;

    const KIND: ResourceKind = ResourceKind::Connection;

    fn registry(&self) -> &Registry<Handle<T>> {
        &self.registry
    }

    fn errors(&self) -> &EventSink<ResourceError> {
        &self.errors
    }

    fn backoff(&self) -> &BackoffSettings {
        &self.settings.backoff
    }

    fn needs_replenishing(&self) -> bool {
        self.registry.healthy_count() < self.settings.min_connections
    }

    async fn top_up(&self) -> Result<(), Error> {
        // Holding on to what we get forces the pool to dial new connections
        // instead of handing out the same idle one again.
        let mut held = Vec::new();
        while self.needs_replenishing() && held.len() < self.settings.max_connections {
            let connection = self
                .pool
                .get()
                .await
                .map_err(|e| from_pool_error(e, self.settings.acquire_timeout()))?;
            held.push(connection);
        }
        Ok(())
    }
}

impl<T: Transport> ConnectionPool<T> {
    /// Build a connection pool, dialling `settings.min_connections` connections upfront.
    ///
    /// It fails if the settings are invalid or if any of the initial connections cannot be
    /// established.
    #[tracing::instrument(name = "connection_pool_new", skip_all)]
    pub async fn new(transport: T, settings: PoolSettings) -> Result<Self, Error> {
        settings.validate().map_err(Error::Configuration)?;

        let registry = Arc::new(Registry::default());
        let (reports, reports_receiver) = mpsc::unbounded_channel();
        let manager = ConnectionManager {
            transport,
            next_id: AtomicU64::new(1),
            registry: Arc::clone(&registry),
            reports: reports.clone(),
        };
        let pool = managed::Pool::builder(manager)
            .max_size(settings.max_connections)
            .timeouts(timeouts(settings.acquire_timeout()))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let mut initial = Vec::with_capacity(settings.min_connections);
        for _ in 0..settings.min_connections {
            initial.push(
                pool.get()
                    .await
                    .map_err(|e| from_pool_error(e, settings.acquire_timeout()))?,
            );
        }
        drop(initial);

        let (errors, error_stream) = EventSink::new(ERROR_BUFFER);
        let (shutdown, shutdown_receiver) = watch::channel(false);
        let health_check_interval = settings.health_check_interval();
        let inner = Arc::new(Shared {
            pool,
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
            min_connections = inner.settings.min_connections,
            max_connections = inner.settings.max_connections,
            "Connection pool ready"
        );
        Ok(Self { inner })
    }

    /// Get a healthy connection.
    ///
    /// Waits up to `acquire_timeout` if the pool is at capacity and every connection is lent
    /// out. Fails immediately with [`Error::Shutdown`] after [`shutdown`](Self::shutdown).
    pub async fn acquire(&self) -> Result<PooledConnection<T>, Error> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let object = self
            .inner
            .pool
            .get()
            .await
            .map_err(|e| from_pool_error(e, self.inner.settings.acquire_timeout()))?;
        Ok(PooledConnection { object })
    }

    /// Hand a connection back to the idle set.
    ///
    /// Equivalent to dropping it. Connections that broke while lent out are discarded the
    /// next time the pool validates them.
    pub fn release(&self, connection: PooledConnection<T>) {
        drop(connection);
    }

    /// Mark a connection as broken: it is discarded, closed and replaced in the background.
    pub fn flag(&self, connection: PooledConnection<T>, reason: anyhow::Error) {
        let handle = Object::take(connection.object);
        self.flag_handle(handle, reason);
    }

    pub(crate) fn flag_handle(&self, handle: Arc<Handle<T>>, reason: anyhow::Error) {
        let reason = handle.mark_flagged().then_some(reason);
        let _ = self.inner.reports.send(Report::Flagged { handle, reason });
    }

    /// Errors about connections of this pool.
    ///
    /// The stream holds up to a fixed number of unread errors; further errors are dropped
    /// (and counted, see [`dropped_errors`](Self::dropped_errors)) until it is drained.
    pub fn errors(&self) -> EventStream<ResourceError> {
        self.inner.error_stream.clone()
    }

    pub fn dropped_errors(&self) -> u64 {
        self.inner.errors.dropped()
    }

    pub(crate) fn forward_errors_to(&self, sender: mpsc::Sender<ResourceError>) {
        self.inner.errors.forward_to(sender);
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
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

    /// Close every connection and stop the supervisor.
    ///
    /// Calling it more than once is a no-op.
    #[tracing::instrument(name = "connection_pool_shutdown", skip(self))]
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.pool.close();
        for handle in self.inner.registry.live() {
            handle.mark_flagged();
            handle.close().await;
        }
        debug!("Connection pool shut down");
    }
}
