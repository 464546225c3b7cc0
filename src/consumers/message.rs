use super::MessageError;
use crate::amqp::convenience::BasicPropertiesExt;
use crate::amqp::transport::{BrokerChannel, Delivery, Transport};
use crate::amqp::ConnectionFactory;
use crate::pool::ChannelHandle;
use amq_protocol_types::DeliveryTag;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Bookkeeping shared by a consumer and every message it surfaced.
#[derive(Debug, Default)]
pub(crate) struct Session {
    /// Messages surfaced in manual-ack mode and not settled yet.
    outstanding: AtomicUsize,
    settled: Notify,
    orphaned: AtomicBool,
}

impl Session {
    fn track(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn settle(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.settled.notify_waiters();
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Resolves once every tracked message has been settled or dropped.
    pub(crate) async fn all_settled(&self) {
        loop {
            let settled = self.settled.notified();
            if self.outstanding() == 0 {
                return;
            }
            settled.await;
        }
    }

    pub(crate) fn orphan(&self) {
        self.orphaned.store(true, Ordering::SeqCst);
    }

    fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::SeqCst)
    }
}

enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// A delivery surfaced by a [`Consumer`](super::Consumer).
///
/// It stays bound to the channel it arrived on: settling it goes through that channel or
/// fails. A message dropped without being settled is nacked with requeue while its channel
/// is still usable, freeing its prefetch slot; otherwise the broker redelivers it once the
/// channel closes.
pub struct Message<T: Transport = ConnectionFactory> {
    delivery: Delivery,
    channel: Arc<ChannelHandle<T>>,
    session: Arc<Session>,
    auto_ack: bool,
    resolved: AtomicBool,
}

impl<T: Transport> Message<T> {
    pub(crate) fn new(
        delivery: Delivery,
        channel: Arc<ChannelHandle<T>>,
        session: Arc<Session>,
        auto_ack: bool,
    ) -> Self {
        if !auto_ack {
            session.track();
        }
        Self {
            delivery,
            channel,
            session,
            auto_ack,
            resolved: AtomicBool::new(auto_ack),
        }
    }

    pub async fn acknowledge(&self) -> Result<(), MessageError> {
        self.settle(Settlement::Ack).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), MessageError> {
        self.settle(Settlement::Nack { requeue }).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), MessageError> {
        self.settle(Settlement::Reject { requeue }).await
    }

    #[tracing::instrument(
        name = "settle_message",
        skip_all,
        fields(delivery_tag = self.delivery.delivery_tag, channel_id = self.channel.id()),
        level = tracing::Level::DEBUG
    )]
    async fn settle(&self, settlement: Settlement) -> Result<(), MessageError> {
        if self.auto_ack {
            return Err(MessageError::AutoAcknowledged);
        }
        if self.is_resolved() {
            return Err(MessageError::AlreadyResolved);
        }
        if self.session.is_orphaned() {
            return Err(MessageError::Orphaned);
        }
        if self.channel.is_flagged() || !self.channel.raw().is_open() {
            return Err(MessageError::ChannelFlagged);
        }
        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MessageError::AlreadyResolved);
        }

        let tag = self.delivery.delivery_tag;
        let channel = self.channel.raw();
        let outcome = match settlement {
            Settlement::Ack => channel.ack(tag, false).await,
            Settlement::Nack { requeue } => channel.nack(tag, false, requeue).await,
            Settlement::Reject { requeue } => channel.reject(tag, requeue).await,
        };
        self.session.settle();
        outcome.map_err(MessageError::Protocol)
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Lookup a string header of the message.
    pub fn header_str(&self, key: &str) -> Option<Cow<'_, str>> {
        self.delivery.properties.get_header_str(key)
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery.delivery_tag
    }

    /// The id of the pooled channel the message arrived on.
    pub fn channel_id(&self) -> u64 {
        self.channel.id()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

impl<T: Transport> Drop for Message<T> {
    fn drop(&mut self) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return;
        }
        self.session.settle();

        if self.session.is_orphaned() || self.channel.is_flagged() || !self.channel.raw().is_open()
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = Arc::clone(&self.channel);
        let delivery_tag = self.delivery.delivery_tag;
        runtime.spawn(async move {
            if let Err(e) = channel.raw().nack(delivery_tag, false, true).await {
                debug!(delivery_tag, "Failed to requeue a dropped message: {e:#}");
            }
        });
    }
}

impl<T: Transport> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("routing_key", &self.delivery.routing_key)
            .field("channel_id", &self.channel.id())
            .field("auto_ack", &self.auto_ack)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
