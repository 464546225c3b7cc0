/// Why a [`Message`](super::Message) could not be settled.
///
/// All of these are terminal: retrying the same call will not succeed.
#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("The message has already been acknowledged or rejected")]
    AlreadyResolved,
    /// The consumer stopped and closed the channel the message arrived on. The broker will
    /// redeliver it.
    #[error("The consumer that received the message has stopped")]
    Orphaned,
    /// Delivery tags are scoped to a channel: the message cannot be settled on another one.
    #[error("The channel the message arrived on is broken")]
    ChannelFlagged,
    #[error("The message was consumed in auto-ack mode and is already settled")]
    AutoAcknowledged,
    #[error("The broker refused to settle the message")]
    Protocol(#[source] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("The consumer has been stopped and cannot be started again")]
    AlreadyStopped,
    #[error("No consumer named '{0}' in the settings")]
    UnknownConsumer(String),
}
