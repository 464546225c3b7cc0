//! Facilities to publish messages to a RabbitMq exchange. Check out [`Publisher`] as a starting point.
mod letter;
mod notification;
mod publisher;

pub use letter::{Envelope, Letter, LetterId};
pub use notification::{Notification, PublishError};
pub use publisher::{Publisher, PublisherError, PublisherState};
