//! Helpers for connecting to a rabbitmq broker, and the boundary the rest of the crate
//! talks to it through.

pub mod configuration;
pub mod convenience;
mod factory;
#[cfg(any(test, feature = "test-util"))]
mod in_memory;
mod protocol;
pub mod transport;

pub use factory::ConnectionFactory;
#[cfg(any(test, feature = "test-util"))]
pub use in_memory::{InMemoryBroker, InMemoryChannel, InMemoryConnection};
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};
