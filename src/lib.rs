//! `carrot-stew` keeps publishers and consumers running against RabbitMQ while
//! connections and channels come and go, built on top of [`lapin`] and [`deadpool`].
//!
//! - [`pool::ConnectionPool`] and [`pool::ChannelPool`] detect broken resources and
//!   replace them in the background.
//! - [`publishers::Publisher`] publishes queued letters and reports on each of them.
//! - [`consumers::Consumer`] surfaces deliveries as messages you acknowledge explicitly.
//! - [`topology::Topologer`] declares exchanges, queues and bindings.
//!
//! Everything talks to the broker through the traits in [`amqp::transport`]:
//! with the `test-util` feature, `amqp::InMemoryBroker` implements them in-process, for tests.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod consumers;
pub mod events;
pub mod pool;
pub mod publishers;
pub mod topology;
