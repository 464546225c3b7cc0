//! Self-healing pools of broker connections and protocol channels, built on [`deadpool`].
//!
//! This module provides two key guarantees:
//! - Broken connections and channels are detected (through the protocol's own error
//!   signals, a periodic health check, or a borrower flagging them) and replaced in the
//!   background, with capped exponential backoff.
//! - Connections are reused across channels to limit overhead.
//!
//! ```rust,no_run
//! use carrot_stew::pool::{ChannelPool, ConnectionPool};
//! use carrot_stew::amqp::ConnectionFactory;
//! use carrot_stew::amqp::configuration::{PoolSettings, RabbitMqSettings};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
//!     let settings = PoolSettings::default();
//!
//!     let connections = ConnectionPool::new(factory, settings.clone()).await?;
//!     let channels = ChannelPool::new(connections, settings).await?;
//!
//!     // borrow a channel from the pool.
//!     let channel = channels.acquire().await?;
//!     channels.release(channel);
//!     Ok(())
//! }
//! ```
use deadpool::managed::Timeouts;
use std::time::Duration;

mod channel;
mod connection;
mod error;
pub(crate) mod recovery;

pub use channel::{ChannelHandle, ChannelManager, ChannelPool, PooledChannel};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionPool, PooledConnection};
pub use error::Error;

/// Capacity of the error stream of each pool.
const ERROR_BUFFER: usize = 1_000;

/// A snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Resources currently held by the pool, idle or lent out.
    pub size: usize,
    pub max_size: usize,
    /// Live resources that are neither flagged nor closed.
    pub healthy: usize,
}

fn timeouts(acquire_timeout: Duration) -> Timeouts {
    Timeouts {
        wait: Some(acquire_timeout),
        create: Some(acquire_timeout),
        recycle: Some(acquire_timeout),
    }
}
