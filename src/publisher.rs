// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publishing
//!
//! `publish` and `send_to_queue` validate the message properties, encode the
//! payload through the bus codec and submit it on the confirm channel. Both
//! resolve once the broker has confirmed the message, which means it was
//! accepted by the broker, not that any consumer has processed it.

use crate::{
    bus::{require_name, MessageBus},
    errors::AmqpError,
    otel,
    properties::PublishOptions,
};
use serde::Serialize;
use tracing::debug;

/// The broker's default exchange, routing by queue name
pub const DEFAULT_EXCHANGE: &str = "";

impl MessageBus {
    /// Publishes `message` to `exchange` under `routing_key`.
    ///
    /// Properties are validated before the broker is contacted, so an invalid
    /// priority fails even while disconnected.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, `""` for the default one
    /// * `routing_key` - Key the exchange routes on
    /// * `message` - Any serializable body
    /// * `options` - Message properties; unset ones get defaults
    ///
    /// # Returns
    /// * `Err(AmqpError::NotConnected)` without a live connection
    /// * `Err(AmqpError::PublishNackedError)` when the broker nacks the message
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let envelope = options.resolve()?;
        let codec = &self.shared.codec;
        let payload = codec.encrypt(message)?;
        let session = self.session().await?;

        debug!(
            exchange,
            routing_key,
            message_id = %envelope.message_id,
            encrypted = codec.is_encrypted(),
            "publishing message"
        );

        let properties = envelope.into_amqp(codec.content_type(), otel::current_context_headers());
        session
            .outbound
            .publish(exchange, routing_key, &payload, properties)
            .await
    }

    /// Sends `message` straight to `queue` through the default exchange.
    ///
    /// # Parameters
    /// * `queue` - Destination queue name, must not be empty
    /// * `message` - Any serializable body
    /// * `options` - Message properties; unset ones get defaults
    pub async fn send_to_queue<T>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        require_name("queue", queue)?;
        self.publish(DEFAULT_EXCHANGE, queue, message, options).await
    }
}
