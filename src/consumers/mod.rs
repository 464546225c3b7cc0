//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a starting point.
//!
//! ```rust,no_run
//! use carrot_stew::amqp::configuration::ConsumerSettings;
//! use carrot_stew::consumers::Consumer;
//! use carrot_stew::pool::ChannelPool;
//!
//! async fn consume(channels: ChannelPool) -> anyhow::Result<()> {
//!     let consumer = Consumer::new(channels, ConsumerSettings::for_queue("orders"));
//!     let messages = consumer.messages();
//!     consumer.start_consuming()?;
//!
//!     while let Some(message) = messages.recv().await {
//!         println!("{}", String::from_utf8_lossy(message.body()));
//!         message.acknowledge().await?;
//!     }
//!     Ok(())
//! }
//! ```
mod consumer;
mod error;
mod message;

pub use consumer::{Consumer, ConsumerState};
pub use error::{ConsumerError, MessageError};
pub use message::Message;
