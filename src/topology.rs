// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Helpers
//!
//! Thin wrappers over the broker's declaration primitives. Each one checks its
//! names and requires a live session.
//!
//! Every call runs on a short-lived channel, so a declaration the broker
//! refuses cannot take the consumers' channel down with it.
//!
//! `assert_queue` also declares the companions configured on the definition:
//! - retry queue: messages rejected from the main queue wait there for the
//!   retry TTL, then dead-letter back to the main queue, until the retry cap
//!   is reached;
//! - DLQ: without a retry queue, rejected messages dead-letter to it; with
//!   one, consumers move messages there once their retries are spent.

use crate::{
    broker::{BrokerChannel, QueueInfo},
    bus::{require_name, MessageBus},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument holding the message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument holding the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Queue argument holding the maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

type Arguments = BTreeMap<ShortString, AMQPValue>;

fn dead_letter_to(args: &mut Arguments, queue: &str) {
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(queue)),
    );
}

fn int_arg(args: &mut Arguments, key: &str, value: Option<i32>) {
    if let Some(value) = value {
        args.insert(ShortString::from(key), AMQPValue::LongInt(LongInt::from(value)));
    }
}

/// Arguments of the main queue, pointing its dead letters at the right companion.
pub(crate) fn queue_arguments(def: &QueueDefinition) -> Arguments {
    let mut args = Arguments::new();

    if let Some(retry) = &def.retry_name {
        dead_letter_to(&mut args, retry);
    } else if let Some(dlq) = &def.dlq_name {
        dead_letter_to(&mut args, dlq);
    }

    int_arg(&mut args, AMQP_HEADERS_MESSAGE_TTL, def.ttl);
    int_arg(&mut args, AMQP_HEADERS_MAX_LENGTH, def.max_length);
    int_arg(&mut args, AMQP_HEADERS_MAX_LENGTH_BYTES, def.max_length_bytes);
    args
}

/// Arguments of the retry companion, returning expired messages to the main queue.
pub(crate) fn retry_arguments(def: &QueueDefinition) -> Arguments {
    let mut args = Arguments::new();
    dead_letter_to(&mut args, &def.name);
    int_arg(&mut args, AMQP_HEADERS_MESSAGE_TTL, def.retry_ttl);
    args
}

impl MessageBus {
    /// Declares an exchange.
    ///
    /// # Parameters
    /// * `def` - Name, kind, flags and arguments of the exchange
    ///
    /// # Returns
    /// * `Err(AmqpError::DeclareExchangeError)` when the broker refuses it,
    ///   for instance because it exists with another kind
    pub async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        require_name("exchange", &def.name)?;
        let session = self.session().await?;

        debug!("creating exchange: {}", def.name);
        session
            .on_scratch(|channel| async move {
                channel
                    .declare_exchange(&def.name, (&def.kind).into(), def.options(), def.arguments())
                    .await
            })
            .await?;
        debug!("exchange: {} was created", def.name);
        Ok(())
    }

    /// Declares the queue and its configured companions. A queue with a retry
    /// companion has its retry cap enforced by every later subscription to it.
    ///
    /// # Returns
    /// The queue name with its message and consumer counts.
    pub async fn assert_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        require_name("queue", &def.name)?;
        let session = self.session().await?;

        let info = session
            .on_scratch(|channel| async move {
                if let Some(retry) = &def.retry_name {
                    declare_companion(&channel, def, retry, retry_arguments(def)).await?;
                }
                if let Some(dlq) = &def.dlq_name {
                    declare_companion(&channel, def, dlq, Arguments::new()).await?;
                }

                debug!("creating queue: {}", def.name);
                channel
                    .declare_queue(
                        &def.name,
                        def.options(),
                        FieldTable::from(queue_arguments(def)),
                    )
                    .await
            })
            .await?;

        self.shared.set_retry_limit(&def.name, def.retry_limit());
        debug!("queue: {} was created", def.name);
        Ok(info)
    }

    /// Cancels the consumers of `queue`, then deletes it.
    ///
    /// # Returns
    /// The number of messages the queue held.
    pub async fn delete_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        require_name("queue", queue)?;

        let link = self.shared.link.lock().await;
        let session = link.session.as_ref().ok_or(AmqpError::NotConnected)?;

        let bound = self.shared.registry.tags_for_queue(queue);
        if !bound.is_empty() {
            debug!(queue, consumers = bound.len(), "cancelling consumers before delete");
            self.shared.drain(session, bound).await?;
        }

        let purged = session
            .on_scratch(|channel| async move { channel.delete_queue(queue).await })
            .await?;
        self.shared.set_retry_limit(queue, None);
        debug!(queue, purged, "queue deleted");
        Ok(purged)
    }

    /// Routes messages published to the binding's exchange under its routing
    /// key to its queue.
    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        require_name("queue", &binding.queue_name)?;
        require_name("exchange", &binding.exchange_name)?;
        let session = self.session().await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        session
            .on_scratch(|channel| async move {
                channel
                    .bind_queue(
                        &binding.queue_name,
                        &binding.exchange_name,
                        &binding.routing_key,
                        FieldTable::default(),
                    )
                    .await
            })
            .await
    }

    /// Removes a binding created with `bind_queue`.
    pub async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        require_name("queue", &binding.queue_name)?;
        require_name("exchange", &binding.exchange_name)?;
        let session = self.session().await?;

        debug!(
            "unbinding queue: {} from the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        session
            .on_scratch(|channel| async move {
                channel
                    .unbind_queue(
                        &binding.queue_name,
                        &binding.exchange_name,
                        &binding.routing_key,
                        FieldTable::default(),
                    )
                    .await
            })
            .await
    }
}

async fn declare_companion(
    channel: &Arc<dyn BrokerChannel>,
    def: &QueueDefinition,
    name: &str,
    args: Arguments,
) -> Result<(), AmqpError> {
    debug!("creating companion queue: {}", name);
    channel
        .declare_queue(name, def.options(), FieldTable::from(args))
        .await
        .map(|_| ())
}
