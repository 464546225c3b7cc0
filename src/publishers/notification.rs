use super::LetterId;
use crate::pool;
use std::fmt;
use std::time::Duration;

/// Why a letter could not be published.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("No healthy channel could be acquired after {attempts} attempts")]
    ChannelUnavailable {
        attempts: u32,
        #[source]
        source: pool::Error,
    },
    #[error("The channel broke while publishing")]
    ChannelFailure(#[source] anyhow::Error),
    #[error("The broker did not confirm the publish within {0:?}")]
    Timeout(Duration),
    #[error("The RabbitMq broker nacked the publishing of the message")]
    Nacked,
    #[error("The message could not be routed: {reply_code} {reply_text}")]
    Unroutable { reply_code: u16, reply_text: String },
    #[error("The publisher was stopped before the message could be published")]
    Stopped,
}

/// The terminal outcome of a queued [`Letter`](super::Letter).
///
/// Exactly one notification is emitted per letter accepted by the publisher.
#[derive(Debug)]
pub struct Notification {
    pub letter_id: LetterId,
    /// `None` if the broker accepted the letter.
    pub error: Option<PublishError>,
    /// Publish attempts made, retries on a fresh channel included.
    pub attempts: u32,
}

impl Notification {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "letter {} published", self.letter_id),
            Some(e) => write!(f, "letter {} failed after {} attempts: {e}", self.letter_id, self.attempts),
        }
    }
}
