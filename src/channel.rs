// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! Lapin-backed implementation of the broker capability traits. `LapinTransport`
//! opens the connection, `LapinConnection` hands out plain and confirm channels
//! and forwards connection errors to the bus, and `LapinChannel` maps each
//! primitive onto the corresponding lapin call.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, CloseObserver, Delivery, DeliveryHandler, QueueInfo,
        Transport,
    },
    errors::AmqpError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code sent to the broker on a deliberate close
const AMQP_REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport {
    connection_name: Option<String>,
}

impl LapinTransport {
    /// Creates a transport that reports `connection_name` to the broker, when given.
    pub fn new(connection_name: Option<String>) -> LapinTransport {
        LapinTransport { connection_name }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn open(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        match Connection::connect(url, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }
    }
}

/// A lapin connection.
pub struct LapinConnection {
    conn: Connection,
}

impl LapinConnection {
    async fn create_channel(&self) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.create_channel().await?;
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    async fn open_confirm_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.create_channel().await?;
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }

        Ok(Arc::new(LapinChannel::new(channel)))
    }

    fn on_close(&self, observer: CloseObserver) {
        self.conn
            .on_error(move |err| observer(AmqpError::ConnectionLost(err.to_string())));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match self.conn.close(AMQP_REPLY_SUCCESS, "bye").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(AmqpError::CloseConnectionError)
            }
            _ => Ok(()),
        }
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Arc<Channel>,
}

impl LapinChannel {
    /// Wraps an open lapin channel.
    pub fn new(channel: Channel) -> LapinChannel {
        LapinChannel {
            channel: Arc::new(channel),
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn prefetch(&self, count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure prefetch");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: DeliveryHandler,
    ) -> Result<(), AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer_tag.to_owned();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        handler(Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            redelivered: delivery.redelivered,
                            properties: delivery.properties,
                            data: delivery.data,
                        })
                        .await
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!(consumer = tag, "consumer stream closed");
        });

        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to cancel the consumer");
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publish confirmation");
                Err(AmqpError::PublishingError)
            }
            Ok(confirmation) if confirmation.is_nack() => {
                error!(exchange, routing_key, "broker rejected the message");
                Err(AmqpError::PublishNackedError)
            }
            _ => Ok(()),
        }
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(name, kind, options, arguments)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name, "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        match self.channel.queue_declare(name, options, arguments).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => Ok(QueueInfo {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the queue");
                AmqpError::DeleteQueueError(name.to_owned())
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                arguments,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                Err(AmqpError::UnbindingExchangeFromQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match self.channel.close(AMQP_REPLY_SUCCESS, "bye").await {
            Err(err) => {
                debug!(error = err.to_string(), "failure to close the channel");
                Err(AmqpError::ChannelError)
            }
            _ => Ok(()),
        }
    }
}
