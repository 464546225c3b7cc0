//! Health and recovery machinery shared by the connection and channel pools.
//!
//! Each pool runs exactly one supervisor task. Broken resources are reported to it (by the
//! protocol's error callbacks, by `flag`, or by its own periodic health check) and it is
//! the only place where replacements are created, so a resource is never replaced twice.
use super::Error;
use crate::amqp::configuration::BackoffSettings;
use crate::events::{EventSink, ResourceError, ResourceKind};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    ceiling: u32,
    failures: u32,
}

impl Backoff {
    pub(crate) fn new(settings: &BackoffSettings) -> Self {
        Self {
            initial: settings.initial_delay(),
            max: settings.max_delay().max(settings.initial_delay()),
            ceiling: settings.retry_ceiling,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exponent = self.failures.min(31);
        self.failures = self.failures.saturating_add(1);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn past_ceiling(&self) -> bool {
        self.failures > self.ceiling
    }
}

/// Resolves once `shutdown` flips to `true` or its sender goes away.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `attempt` until it succeeds, sleeping with capped exponential backoff in between.
///
/// Every failure is handed to `on_failure` together with the backoff state, so callers can
/// surface it. Returns `None` if shutdown is signalled before an attempt succeeds.
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    settings: &BackoffSettings,
    shutdown: &mut watch::Receiver<bool>,
    mut attempt: F,
    mut on_failure: impl FnMut(E, &Backoff),
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(settings);
    loop {
        if *shutdown.borrow() {
            return None;
        }
        match attempt().await {
            Ok(value) => return Some(value),
            Err(e) => {
                let delay = backoff.next_delay();
                on_failure(e, &backoff);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_signalled(shutdown) => return None,
                }
            }
        }
    }
}

/// A pooled connection or channel, as seen by the supervisor.
#[async_trait::async_trait]
pub(crate) trait PooledResource: Send + Sync + 'static {
    fn id(&self) -> u64;

    fn is_flagged(&self) -> bool;

    /// Returns `true` if this call is the one that flagged the resource.
    fn mark_flagged(&self) -> bool;

    /// Liveness as reported by the protocol client.
    fn is_alive(&self) -> bool;

    /// Close the underlying resource, ignoring failures: it is being discarded anyway.
    async fn close(&self);

    fn is_healthy(&self) -> bool {
        !self.is_flagged() && self.is_alive()
    }
}

/// Something a supervisor has to react to.
pub(crate) enum Report<H> {
    /// The protocol client signalled that resource `id` broke.
    Broken { id: u64, error: anyhow::Error },
    /// A borrower gave the resource back as broken (`reason` is `Some`) or retired it
    /// (`reason` is `None`). Either way it is already detached from the pool.
    Flagged {
        handle: Arc<H>,
        reason: Option<anyhow::Error>,
    },
}

/// Weak references to every live resource a pool has created, idle or lent.
pub(crate) struct Registry<H> {
    entries: Mutex<Vec<Weak<H>>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<H: PooledResource> Registry<H> {
    pub(crate) fn register(&self, handle: &Arc<H>) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.strong_count() > 0);
        entries.push(Arc::downgrade(handle));
    }

    pub(crate) fn live(&self) -> Vec<Arc<H>> {
        let mut entries = self.entries.lock();
        entries.retain(|entry| entry.strong_count() > 0);
        entries.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn find(&self, id: u64) -> Option<Arc<H>> {
        self.live().into_iter().find(|handle| handle.id() == id)
    }

    pub(crate) fn healthy_count(&self) -> usize {
        self.live().iter().filter(|handle| handle.is_healthy()).count()
    }
}

/// The pool-specific half of a supervisor.
#[async_trait::async_trait]
pub(crate) trait Supervised: Send + Sync + 'static {
    type Resource: PooledResource;

    const KIND: ResourceKind;

    fn registry(&self) -> &Registry<Self::Resource>;

    fn errors(&self) -> &EventSink<ResourceError>;

    fn backoff(&self) -> &BackoffSettings;

    /// Whether the pool is below its configured minimum of healthy resources.
    fn needs_replenishing(&self) -> bool;

    /// Create resources until the minimum is met (or the pool is at capacity).
    async fn top_up(&self) -> Result<(), Error>;
}

/// The supervisor loop. It exits on shutdown or once the pool itself has been dropped.
pub(crate) async fn supervise<S: Supervised>(
    pool: Weak<S>,
    mut reports: mpsc::UnboundedReceiver<Report<S::Resource>>,
    mut shutdown: watch::Receiver<bool>,
    health_check_interval: Duration,
) {
    let mut ticker = tokio::time::interval(health_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let replace = tokio::select! {
            biased;

            _ = shutdown_signalled(&mut shutdown) => break,

            report = reports.recv() => {
                let (Some(report), Some(pool)) = (report, pool.upgrade()) else { break };
                handle_report(pool.as_ref(), report).await
            }

            _ = ticker.tick() => {
                let Some(pool) = pool.upgrade() else { break };
                health_check(pool.as_ref())
            }
        };

        if replace {
            let Some(pool) = pool.upgrade() else { break };
            replenish(pool.as_ref(), &mut shutdown).await;
        }
    }
    debug!(kind = %S::KIND, "Pool supervisor stopped");
}

async fn handle_report<S: Supervised>(pool: &S, report: Report<S::Resource>) -> bool {
    match report {
        Report::Broken { id, error } => {
            let Some(handle) = pool.registry().find(id) else {
                // Already discarded by the pool.
                return false;
            };
            if !handle.mark_flagged() {
                return false;
            }
            warn!(kind = %S::KIND, id, "Broken resource detected: {error:#}");
            pool.errors()
                .emit(ResourceError::new(S::KIND, Some(id), error));
            true
        }
        Report::Flagged { handle, reason } => {
            handle.mark_flagged();
            if let Some(reason) = reason {
                warn!(kind = %S::KIND, id = handle.id(), "Resource flagged as broken: {reason:#}");
                pool.errors()
                    .emit(ResourceError::new(S::KIND, Some(handle.id()), reason));
            }
            handle.close().await;
            true
        }
    }
}

fn health_check<S: Supervised>(pool: &S) -> bool {
    let mut replace = false;
    for handle in pool.registry().live() {
        if !handle.is_flagged() && !handle.is_alive() && handle.mark_flagged() {
            let id = handle.id();
            warn!(kind = %S::KIND, id, "Health check found a closed resource");
            pool.errors().emit(ResourceError::new(
                S::KIND,
                Some(id),
                anyhow::anyhow!("{} {id} is no longer open", S::KIND),
            ));
            replace = true;
        }
    }
    replace || pool.needs_replenishing()
}

async fn replenish<S: Supervised>(pool: &S, shutdown: &mut watch::Receiver<bool>) {
    if !pool.needs_replenishing() {
        return;
    }
    let replenished = retry_with_backoff(
        pool.backoff(),
        shutdown,
        || pool.top_up(),
        |e, backoff| {
            let failures = backoff.failures();
            if backoff.past_ceiling() {
                error!(kind = %S::KIND, failures, "Still unable to replace broken resources: {e:#}");
            } else {
                warn!(kind = %S::KIND, failures, "Failed to replace broken resources: {e:#}");
            }
            pool.errors().emit(ResourceError::new(
                S::KIND,
                None,
                anyhow::Error::new(e)
                    .context(format!("replacement attempt {failures} failed")),
            ));
        },
    )
    .await;
    if replenished.is_some() {
        debug!(kind = %S::KIND, "Pool replenished");
    }
}
