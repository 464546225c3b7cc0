use super::{BindingDescriptor, ExchangeDescriptor, QueueDescriptor, TopologyConfig};
use crate::amqp::transport::{BrokerChannel, Transport};
use crate::amqp::ConnectionFactory;
use crate::pool::{self, ChannelPool, PooledChannel};
use tracing::{debug, warn};

/// A failed topology operation.
#[derive(thiserror::Error, Debug)]
pub enum TopologyError {
    #[error("Failed to get a channel for the topology operation")]
    Pool(#[from] pool::Error),
    #[error("Failed to {object}")]
    Declare {
        /// The operation and the object it was applied to, e.g. `declare queue 'orders'`.
        object: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{} topology operations failed", .0.len())]
    Aggregate(Vec<TopologyError>),
}

/// Declares, binds and deletes exchanges and queues.
///
/// Each operation borrows one channel from the pool and hands it back. Failures are
/// returned to the caller as-is: nothing is retried.
pub struct Topologer<T: Transport = ConnectionFactory> {
    channels: ChannelPool<T>,
}

impl<T: Transport> Clone for Topologer<T> {
    fn clone(&self) -> Self {
        Self {
            channels: self.channels.clone(),
        }
    }
}

impl<T: Transport> Topologer<T> {
    pub fn new(channels: ChannelPool<T>) -> Self {
        Self { channels }
    }

    /// Declare everything in `config`: exchanges, then queues, then exchange-to-exchange
    /// bindings, then queue bindings.
    ///
    /// The first failure is returned straight away unless `ignore_errors` is set, in which
    /// case every operation is attempted and the failures come back together as
    /// [`TopologyError::Aggregate`].
    #[tracing::instrument(name = "build_topology", skip_all)]
    pub async fn build_topology(
        &self,
        config: &TopologyConfig,
        ignore_errors: bool,
    ) -> Result<(), TopologyError> {
        let mut failures = Vec::new();
        for exchange in &config.exchanges {
            keep_going(self.create_exchange(exchange).await, ignore_errors, &mut failures)?;
        }
        for queue in &config.queues {
            keep_going(self.create_queue(queue).await, ignore_errors, &mut failures)?;
        }
        for binding in &config.exchange_bindings {
            keep_going(self.bind_exchange(binding).await, ignore_errors, &mut failures)?;
        }
        for binding in &config.queue_bindings {
            keep_going(self.bind_queue(binding).await, ignore_errors, &mut failures)?;
        }

        if failures.is_empty() {
            debug!(
                exchanges = config.exchanges.len(),
                queues = config.queues.len(),
                bindings = config.exchange_bindings.len() + config.queue_bindings.len(),
                "Topology built"
            );
            Ok(())
        } else {
            Err(TopologyError::Aggregate(failures))
        }
    }

    #[tracing::instrument(skip_all, fields(exchange = %exchange.name))]
    pub async fn create_exchange(&self, exchange: &ExchangeDescriptor) -> Result<(), TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().declare_exchange(exchange).await;
        self.settle(channel, outcome, || {
            format!("declare exchange '{}'", exchange.name)
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().delete_exchange(name, if_unused).await;
        self.settle(channel, outcome, || format!("delete exchange '{name}'"))
    }

    #[tracing::instrument(skip_all, fields(queue = %queue.name))]
    pub async fn create_queue(&self, queue: &QueueDescriptor) -> Result<(), TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().declare_queue(queue).await;
        self.settle(channel, outcome, || format!("declare queue '{}'", queue.name))
    }

    /// Returns the number of messages deleted along with the queue.
    #[tracing::instrument(skip(self))]
    pub async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().delete_queue(name, if_unused, if_empty).await;
        self.settle(channel, outcome, || format!("delete queue '{name}'"))
    }

    /// Returns the number of messages purged.
    #[tracing::instrument(skip(self))]
    pub async fn purge_queue(&self, name: &str) -> Result<u32, TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().purge_queue(name).await;
        self.settle(channel, outcome, || format!("purge queue '{name}'"))
    }

    /// Bind the queue `binding.destination` to the exchange `binding.source`.
    #[tracing::instrument(skip_all, fields(source = %binding.source, destination = %binding.destination))]
    pub async fn bind_queue(&self, binding: &BindingDescriptor) -> Result<(), TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().bind_queue(binding).await;
        self.settle(channel, outcome, || describe("bind queue", binding))
    }

    #[tracing::instrument(skip_all, fields(source = %binding.source, destination = %binding.destination))]
    pub async fn unbind_queue(&self, binding: &BindingDescriptor) -> Result<(), TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().unbind_queue(binding).await;
        self.settle(channel, outcome, || describe("unbind queue", binding))
    }

    /// Route messages from the exchange `binding.source` to the exchange
    /// `binding.destination`.
    #[tracing::instrument(skip_all, fields(source = %binding.source, destination = %binding.destination))]
    pub async fn bind_exchange(&self, binding: &BindingDescriptor) -> Result<(), TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().bind_exchange(binding).await;
        self.settle(channel, outcome, || describe("bind exchange", binding))
    }

    #[tracing::instrument(skip_all, fields(source = %binding.source, destination = %binding.destination))]
    pub async fn unbind_exchange(&self, binding: &BindingDescriptor) -> Result<(), TopologyError> {
        let channel = self.channels.acquire().await?;
        let outcome = channel.raw().unbind_exchange(binding).await;
        self.settle(channel, outcome, || describe("unbind exchange", binding))
    }

    /// Hand the channel back, or retire it if the operation failed: the broker closes the
    /// channel on most topology errors.
    fn settle<R>(
        &self,
        channel: PooledChannel<T>,
        outcome: Result<R, anyhow::Error>,
        object: impl FnOnce() -> String,
    ) -> Result<R, TopologyError> {
        match outcome {
            Ok(value) => {
                self.channels.release(channel);
                Ok(value)
            }
            Err(source) => {
                self.channels.retire(channel);
                let object = object();
                warn!("Failed to {object}: {source:#}");
                Err(TopologyError::Declare { object, source })
            }
        }
    }
}

fn describe(operation: &str, binding: &BindingDescriptor) -> String {
    format!(
        "{operation} '{}' to '{}' with routing key '{}'",
        binding.destination, binding.source, binding.routing_key
    )
}

fn keep_going(
    outcome: Result<(), TopologyError>,
    ignore_errors: bool,
    failures: &mut Vec<TopologyError>,
) -> Result<(), TopologyError> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if ignore_errors => {
            failures.push(e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
