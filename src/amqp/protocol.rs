//! [`lapin`]-backed implementations of the broker boundary.
use crate::amqp::transport::{
    BrokerChannel, BrokerConnection, ConsumeOptions, Confirmation, Delivery, DeliveryStream,
    ErrorCallback,
};
use crate::publishers::Envelope;
use crate::topology::{field_table, BindingDescriptor, ExchangeDescriptor, QueueDescriptor};
use amq_protocol_types::DeliveryTag;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm;
use lapin::types::FieldTable;
use lapin::{Channel, Connection};

/// Reply code used for graceful closes.
const REPLY_SUCCESS: u16 = 200;

#[async_trait::async_trait]
impl BrokerConnection for Connection {
    type Channel = Channel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(&self) -> Result<Channel, anyhow::Error> {
        Ok(self.create_channel().await?)
    }

    fn is_connected(&self) -> bool {
        self.status().connected()
    }

    fn on_error(&self, mut callback: ErrorCallback) {
        Connection::on_error(self, move |e| callback(e.into()));
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(Connection::close(self, REPLY_SUCCESS, "OK").await?)
    }
}

#[async_trait::async_trait]
impl BrokerChannel for Channel {
    fn is_open(&self) -> bool {
        self.status().connected()
    }

    fn on_error(&self, mut callback: ErrorCallback) {
        Channel::on_error(self, move |e| callback(e.into()));
    }

    async fn enable_confirms(&self) -> Result<(), anyhow::Error> {
        Ok(self
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?)
    }

    /// The mandatory flag tells the broker how to react if the message cannot be routed to
    /// a queue. If it is set, the broker returns the message with a Return method; otherwise
    /// the broker silently drops it.
    #[tracing::instrument(level = "debug", skip(self, body))]
    async fn publish(
        &self,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<Confirmation, anyhow::Error> {
        let options = BasicPublishOptions {
            mandatory: envelope.mandatory,
            immediate: envelope.immediate,
        };
        let confirm = self
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                options,
                body,
                envelope.properties.clone(),
            )
            .await?
            .await?;

        Ok(match confirm {
            publisher_confirm::Confirmation::Ack(Some(returned)) => Confirmation::Returned {
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.to_string(),
            },
            publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
            publisher_confirm::Confirmation::Nack(_) => Confirmation::Nack,
            publisher_confirm::Confirmation::NotRequested => Confirmation::NotRequested,
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = self
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?)
    }

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?)
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(Channel::close(self, REPLY_SUCCESS, "OK").await?)
    }

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<(), anyhow::Error> {
        let options = ExchangeDeclareOptions {
            passive: exchange.passive,
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            internal: exchange.internal,
            nowait: exchange.no_wait,
        };
        Ok(self
            .exchange_declare(
                &exchange.name,
                (&exchange.kind).into(),
                options,
                field_table(&exchange.arguments),
            )
            .await?)
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), anyhow::Error> {
        let options = ExchangeDeleteOptions {
            if_unused,
            nowait: false,
        };
        Ok(self.exchange_delete(name, options).await?)
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: queue.passive,
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            nowait: queue.no_wait,
        };
        self.queue_declare(&queue.name, options, field_table(&queue.arguments))
            .await?;
        Ok(())
    }

    async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, anyhow::Error> {
        let options = QueueDeleteOptions {
            if_unused,
            if_empty,
            nowait: false,
        };
        Ok(self.queue_delete(name, options).await?)
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, anyhow::Error> {
        Ok(self
            .queue_purge(name, QueuePurgeOptions { nowait: false })
            .await?)
    }

    async fn bind_queue(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error> {
        Ok(self
            .queue_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                field_table(&binding.arguments),
            )
            .await?)
    }

    async fn unbind_queue(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error> {
        Ok(self
            .queue_unbind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                field_table(&binding.arguments),
            )
            .await?)
    }

    async fn bind_exchange(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error> {
        Ok(self
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeBindOptions {
                    nowait: binding.no_wait,
                },
                field_table(&binding.arguments),
            )
            .await?)
    }

    async fn unbind_exchange(&self, binding: &BindingDescriptor) -> Result<(), anyhow::Error> {
        Ok(self
            .exchange_unbind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeUnbindOptions {
                    nowait: binding.no_wait,
                },
                field_table(&binding.arguments),
            )
            .await?)
    }
}
