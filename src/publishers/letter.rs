use crate::amqp::convenience::set_header;
use lapin::types::AMQPValue;
use lapin::BasicProperties;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Identifies a [`Letter`] and the [`Notification`](super::Notification) reporting on it.
pub type LetterId = u64;

static NEXT_LETTER_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Where and how a message is published.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The name of the exchange we are publishing the message to.
    /// The empty string is the default exchange, which routes on queue names.
    pub exchange: String,
    /// The routing key used by the exchange to determine which queues receive the message.
    pub routing_key: String,
    /// Ask the broker to return the message if it cannot be routed to any queue.
    pub mandatory: bool,
    /// RabbitMQ 3.0+ refuses this flag with a channel error.
    pub immediate: bool,
    /// Content type, headers and the other AMQP properties of the message.
    pub properties: BasicProperties,
}

impl Envelope {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: false,
            immediate: false,
            properties: BasicProperties::default().with_content_type(DEFAULT_CONTENT_TYPE.into()),
        }
    }

    #[must_use]
    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties = self
            .properties
            .with_content_type(content_type.into().into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: AMQPValue) -> Self {
        self.properties = set_header(self.properties, name, value);
        self
    }

    /// Replace all AMQP properties, content type included.
    #[must_use]
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str())
    }
}

/// An outbound message, queued on a [`Publisher`](super::Publisher).
#[derive(Debug, Clone, PartialEq)]
pub struct Letter {
    pub id: LetterId,
    pub envelope: Envelope,
    pub body: Vec<u8>,
    /// How many times a publish that failed because its channel broke is retried on a fresh
    /// channel before the letter is reported as failed.
    pub retry_count: u32,
}

impl Letter {
    /// A letter with a fresh id, unique within the process, and a single retry.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: NEXT_LETTER_ID.fetch_add(1, Ordering::Relaxed),
            envelope: Envelope::new(exchange, routing_key),
            body: body.into(),
            retry_count: 1,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: LetterId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = envelope;
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// The envelope as sent to the broker: timestamped, identified by the letter id, and
    /// persistent.
    pub(crate) fn stamped_envelope(&self) -> Envelope {
        let current_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|ct| ct.as_secs());

        let props = self.envelope.properties.clone();
        let props = if let Some(ct) = current_timestamp {
            let ts = *props.timestamp();
            props.with_timestamp(ts.unwrap_or(ct))
        } else {
            warn!("System time is before 1970");
            props
        };
        let message_id = props
            .message_id()
            .clone()
            .unwrap_or_else(|| self.id.to_string().into());
        // Delivery mode: Non-persistent (1) or persistent (2).
        let props = props.with_message_id(message_id).with_delivery_mode(2);

        Envelope {
            properties: props,
            ..self.envelope.clone()
        }
    }
}
